use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use broker_protocol::{canonical, Envelope};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::connection::{Connection, ConnectionConfig, CLOSE_DRAIN_WINDOW};
use crate::error::BrokerError;
use crate::registry::Role;
use crate::roles;
use crate::state::BrokerState;

/// Outbound queue depth per connection — generous enough to absorb a burst
/// of forwarded ICE candidates without backpressuring the reader task.
const OUTBOUND_CAPACITY: usize = 64;

pub async fn serve(state: Arc<BrokerState>) -> anyhow::Result<()> {
    if state.config.server.enable_unified_port {
        serve_unified(state).await
    } else {
        serve_split(state).await
    }
}

async fn serve_unified(state: Arc<BrokerState>) -> anyhow::Result<()> {
    let addr = bind_addr(&state.config.server.host, state.config.server.unified_port)?;
    let app = unified_router(Arc::clone(&state));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind unified port {addr}"))?;

    tracing::info!(%addr, "listening (unified port)");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(anyhow::Error::from)
}

/// Legacy mode: one listener per role, plus a dedicated admin port for
/// `/healthz` and `/metrics`. Each listener runs on its own task; the
/// process shuts down once all of them have stopped.
async fn serve_split(state: Arc<BrokerState>) -> anyhow::Result<()> {
    let host = state.config.server.host.clone();
    let mut handles = Vec::new();

    handles.push(spawn_role_listener(&host, state.config.server.player_port, Role::Player, Arc::clone(&state)).await?);
    handles.push(spawn_role_listener(&host, state.config.server.streamer_port, Role::Streamer, Arc::clone(&state)).await?);
    if state.config.limits.enable_sfu {
        handles.push(spawn_role_listener(&host, state.config.server.sfu_port, Role::Sfu, Arc::clone(&state)).await?);
    }
    handles.push(spawn_admin_listener(&host, state.config.server.http_port, state).await?);

    for handle in handles {
        handle.await.context("listener task panicked")??;
    }
    Ok(())
}

async fn spawn_role_listener(
    host: &str,
    port: u16,
    role: Role,
    state: Arc<BrokerState>,
) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
    let addr = bind_addr(host, port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {role} port {addr}"))?;
    let app = role_router(role, state);
    tracing::info!(%addr, %role, "listening (split port)");
    Ok(tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(anyhow::Error::from)
    }))
}

async fn spawn_admin_listener(
    host: &str,
    port: u16,
    state: Arc<BrokerState>,
) -> anyhow::Result<tokio::task::JoinHandle<anyhow::Result<()>>> {
    let addr = bind_addr(host, port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin http port {addr}"))?;
    let app = admin_router(state);
    tracing::info!(%addr, "listening (admin http)");
    Ok(tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(anyhow::Error::from)
    }))
}

fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))
}

/// Shared by every listener: stop accepting new connections on SIGINT or
/// SIGTERM. Existing connections are left to their own reader/writer tasks,
/// which unwind on their own once the sockets close.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// One port, path-dispatched to a role. `/unreal` is routed to the player
/// handler — the Unreal-engine reference client is treated as a full player,
/// not a distinct role.
fn unified_router(state: Arc<BrokerState>) -> Router {
    let player_path = state.config.server.player_path.clone();
    let streamer_path = state.config.server.streamer_path.clone();
    let sfu_path = state.config.server.sfu_path.clone();
    let unreal_path = state.config.server.unreal_path.clone();
    let enable_sfu = state.config.limits.enable_sfu;

    let mut router = Router::new()
        .route(&player_path, get(upgrade_player))
        .route(&unreal_path, get(upgrade_player))
        .route(&streamer_path, get(upgrade_streamer))
        .route("/", get(upgrade_streamer))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint));

    if enable_sfu {
        router = router.route(&sfu_path, get(upgrade_sfu));
    }
    router = router.fallback(unknown_path);

    with_observability(router).with_state(state)
}

fn role_router(role: Role, state: Arc<BrokerState>) -> Router {
    let router = match role {
        Role::Player => Router::new().route("/", get(upgrade_player)),
        Role::Streamer => Router::new().route("/", get(upgrade_streamer)),
        Role::Sfu => Router::new().route("/", get(upgrade_sfu)),
    }
    .fallback(unknown_path);
    with_observability(router).with_state(state)
}

fn admin_router(state: Arc<BrokerState>) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .fallback(unknown_path);
    with_observability(router).with_state(state)
}

/// Matches no configured route. Logged via `BrokerError::UnknownRole` so a
/// stray client hitting the wrong path shows up the same way every other
/// rejection does, then answered with a plain 404 — no connection record is
/// ever created for a request that never reaches a WebSocket upgrade.
async fn unknown_path(uri: axum::http::Uri) -> impl IntoResponse {
    let err = BrokerError::UnknownRole(uri.path().to_string());
    tracing::debug!(%err, "no route matched");
    axum::http::StatusCode::NOT_FOUND
}

fn with_observability(router: Router<Arc<BrokerState>>) -> Router<Arc<BrokerState>> {
    router
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn upgrade_player(ws: WebSocketUpgrade, State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let max = state.config.limits.max_frame_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| accept(socket, state, Role::Player))
}

async fn upgrade_streamer(ws: WebSocketUpgrade, State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let max = state.config.limits.max_frame_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| accept(socket, state, Role::Streamer))
}

async fn upgrade_sfu(ws: WebSocketUpgrade, State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let max = state.config.limits.max_frame_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| accept(socket, state, Role::Sfu))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<Arc<BrokerState>>) -> String {
    state.metrics.render_prometheus(state.started_at)
}

/// Registers the connection, then drives its reader and writer as two
/// independent tasks until either side gives up. The reader owns liveness
/// (idle timeout, ping/pong bookkeeping, frame decode); the writer owns
/// only draining the outbound queue and sending periodic keepalive pings.
async fn accept(socket: WebSocket, state: Arc<BrokerState>, role: Role) {
    let id = Uuid::new_v4();
    let config = ConnectionConfig {
        outbound_capacity: OUTBOUND_CAPACITY,
        ping_interval: Duration::from_secs(state.config.limits.ping_interval_seconds),
        connection_timeout: Duration::from_secs(state.config.limits.connection_timeout_seconds),
    };
    let conn = Arc::new(Connection::new(id, role, config, Arc::clone(&state.metrics)));
    state.registry.add(Arc::clone(&conn));
    state.metrics.connection_opened(role);
    tracing::info!(conn_id = %id, %role, "connection established");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(run_writer(Arc::clone(&conn), sink));

    run_reader(&state, &conn, stream).await;

    conn.close();
    if tokio::time::timeout(CLOSE_DRAIN_WINDOW, &mut writer).await.is_err() {
        writer.abort();
    }

    roles::teardown(&state, &conn);
    tracing::info!(conn_id = %id, %role, "connection closed");
}

async fn run_reader(state: &Arc<BrokerState>, conn: &Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    let idle_timeout = conn.config.connection_timeout;

    loop {
        tokio::select! {
            _ = conn.close_signal().notified() => break,
            polled = tokio::time::timeout(idle_timeout, stream.next()) => {
                let Ok(frame) = polled else {
                    let err = BrokerError::IdleTimeout;
                    tracing::debug!(conn_id = %conn.id, %err, "closing connection");
                    break;
                };
                let Some(frame) = frame else { break };

                match frame {
                    Ok(Message::Text(text)) => match Envelope::parse(&text) {
                        Ok(env) => roles::dispatch(state, conn, env).await,
                        Err(e) => {
                            let err = BrokerError::from(e);
                            tracing::debug!(conn_id = %conn.id, %err, "rejecting frame");
                            state.metrics.malformed_frame();
                            conn.send(&canonical::error(err.to_string()));
                        }
                    },
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => conn.touch(),
                    Ok(Message::Binary(_)) => {
                        tracing::debug!(conn_id = %conn.id, "ignoring binary frame");
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                }
            }
        }
    }
}

async fn run_writer(conn: Arc<Connection>, mut sink: SplitSink<WebSocket, Message>) {
    let mut ping_timer = tokio::time::interval(conn.config.ping_interval);
    ping_timer.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            outbound = conn.next_outbound() => {
                match outbound {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break, // closed and fully drained
                }
            }
            _ = ping_timer.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "".into(),
        })))
        .await;
    let _ = sink.close().await;
}
