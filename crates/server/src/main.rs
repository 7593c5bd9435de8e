mod config;
mod connection;
mod error;
mod metrics;
mod registry;
mod roles;
mod state;
mod subscription;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::metrics::AtomicMetrics;
use crate::registry::Role;
use crate::state::BrokerState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/broker.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.unified_port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let state = BrokerState::new(config, Arc::new(AtomicMetrics::new()));
    spawn_idle_reaper(Arc::clone(&state));

    tracing::info!("===========================================");
    tracing::info!("  Pixel Streaming Signalling Broker");
    tracing::info!("===========================================");

    transport::serve(state).await
}

/// Backstop sweep over every connection's `last_activity`, independent of
/// each connection's own reader-side idle timeout. Catches connections
/// whose reader task is itself wedged (e.g. behind a stalled OS socket
/// buffer) and that would otherwise never notice they've gone idle.
fn spawn_idle_reaper(state: Arc<BrokerState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            for role in [Role::Player, Role::Streamer, Role::Sfu] {
                let timeout = Duration::from_secs(state.config.limits.connection_timeout_seconds);
                for conn in state.registry.enumerate(role) {
                    if conn.is_closed() {
                        continue;
                    }
                    if conn.last_activity().elapsed() > timeout {
                        tracing::info!(conn_id = %conn.id, %role, "reaping idle connection");
                        conn.close();
                    }
                }
            }
        }
    });
}
