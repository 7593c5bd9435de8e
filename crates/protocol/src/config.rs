use serde::{Deserialize, Serialize};

/// Top-level broker configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Listener addresses and path routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for every listener this process opens.
    #[serde(default = "default_host")]
    pub host: String,
    /// Single-port mode: one listener, path-dispatched to a role.
    #[serde(default = "default_true")]
    pub enable_unified_port: bool,
    #[serde(default = "default_unified_port")]
    pub unified_port: u16,
    /// Split (legacy) mode: one hard-wired port per role.
    #[serde(default = "default_player_port")]
    pub player_port: u16,
    #[serde(default = "default_streamer_port")]
    pub streamer_port: u16,
    #[serde(default = "default_sfu_port")]
    pub sfu_port: u16,
    /// REST admin surface port. Only `/healthz` and `/metrics` are served on it today.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_player_path")]
    pub player_path: String,
    #[serde(default = "default_streamer_path")]
    pub streamer_path: String,
    #[serde(default = "default_sfu_path")]
    pub sfu_path: String,
    #[serde(default = "default_unreal_path")]
    pub unreal_path: String,
}

/// Capacity and liveness tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum players a single streamer may have subscribed at once.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: u32,
    /// Whether the `/sfu` path (and split-mode SFU port) accept connections.
    #[serde(default = "default_true")]
    pub enable_sfu: bool,
    /// Maximum inbound WebSocket frame size, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// WebSocket-level keepalive ping cadence.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    /// Reader-idle threshold before a connection is closed.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            enable_unified_port: true,
            unified_port: default_unified_port(),
            player_port: default_player_port(),
            streamer_port: default_streamer_port(),
            sfu_port: default_sfu_port(),
            http_port: default_http_port(),
            player_path: default_player_path(),
            streamer_path: default_streamer_path(),
            sfu_path: default_sfu_path(),
            unreal_path: default_unreal_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_subscribers: default_max_subscribers(),
            enable_sfu: true,
            max_frame_size: default_max_frame_size(),
            ping_interval_seconds: default_ping_interval(),
            connection_timeout_seconds: default_connection_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Validate configuration semantics, returning every issue found.
    ///
    /// Issues are prefixed `ERROR:` (fatal — refuse to start) or `WARNING:`
    /// (advisory — start anyway, log loudly). `Ok(())` means no issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.host.trim().is_empty() {
            issues.push("ERROR: server.host must not be empty.".to_string());
        }

        if self.server.enable_unified_port && self.server.unified_port == 0 {
            issues.push("ERROR: server.unified_port must be between 1 and 65535, got 0.".to_string());
        }

        if !self.server.enable_unified_port {
            let ports = [
                ("player_port", self.server.player_port),
                ("streamer_port", self.server.streamer_port),
                ("sfu_port", self.server.sfu_port),
            ];
            for (name, port) in ports {
                if port == 0 {
                    issues.push(format!(
                        "ERROR: server.{name} must be between 1 and 65535, got 0."
                    ));
                }
            }
            if self.server.player_port == self.server.streamer_port {
                issues.push(
                    "ERROR: server.player_port and server.streamer_port must differ in split mode."
                        .to_string(),
                );
            }
            if self.limits.enable_sfu && self.server.sfu_port == self.server.player_port {
                issues.push(
                    "ERROR: server.sfu_port must differ from server.player_port in split mode."
                        .to_string(),
                );
            }
            if self.limits.enable_sfu && self.server.sfu_port == self.server.streamer_port {
                issues.push(
                    "ERROR: server.sfu_port must differ from server.streamer_port in split mode."
                        .to_string(),
                );
            }
        }

        if self.server.http_port == 0 {
            issues.push("ERROR: server.http_port must be between 1 and 65535, got 0.".to_string());
        }

        for (name, path) in [
            ("player_path", &self.server.player_path),
            ("streamer_path", &self.server.streamer_path),
            ("sfu_path", &self.server.sfu_path),
            ("unreal_path", &self.server.unreal_path),
        ] {
            if !path.starts_with('/') {
                issues.push(format!(
                    "ERROR: server.{name} must start with '/', got '{path}'."
                ));
            }
        }

        if self.limits.max_subscribers == 0 {
            issues.push("ERROR: limits.max_subscribers must be at least 1.".to_string());
        } else if self.limits.max_subscribers > 10_000 {
            issues.push(format!(
                "WARNING: limits.max_subscribers is {}, which is unusually high and may indicate \
                 a misconfiguration. Typical values: 10-500.",
                self.limits.max_subscribers
            ));
        }

        if self.limits.max_frame_size < 1024 {
            issues.push(format!(
                "ERROR: limits.max_frame_size must be at least 1024 bytes \
                 (SDP payloads routinely exceed this), got {}.",
                self.limits.max_frame_size
            ));
        } else if self.limits.max_frame_size > 8 * 1024 * 1024 {
            issues.push(format!(
                "WARNING: limits.max_frame_size is {} bytes (>8MiB) — unusually large for a \
                 signalling message.",
                self.limits.max_frame_size
            ));
        }

        if self.limits.ping_interval_seconds == 0 {
            issues.push("ERROR: limits.ping_interval_seconds must be at least 1.".to_string());
        }

        if self.limits.connection_timeout_seconds == 0 {
            issues.push("ERROR: limits.connection_timeout_seconds must be at least 1.".to_string());
        } else if self.limits.connection_timeout_seconds <= self.limits.ping_interval_seconds {
            issues.push(format!(
                "WARNING: limits.connection_timeout_seconds ({}) should exceed \
                 limits.ping_interval_seconds ({}), or connections may be reaped between pings.",
                self.limits.connection_timeout_seconds, self.limits.ping_interval_seconds
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_unified_port() -> u16 {
    8888
}
fn default_player_port() -> u16 {
    8889
}
fn default_streamer_port() -> u16 {
    8888
}
fn default_sfu_port() -> u16 {
    8890
}
fn default_http_port() -> u16 {
    8080
}
fn default_player_path() -> String {
    "/player".to_string()
}
fn default_streamer_path() -> String {
    "/streamer".to_string()
}
fn default_sfu_path() -> String {
    "/sfu".to_string()
}
fn default_unreal_path() -> String {
    "/unreal".to_string()
}
fn default_max_subscribers() -> u32 {
    100
}
fn default_max_frame_size() -> usize {
    65536
}
fn default_ping_interval() -> u64 {
    30
}
fn default_connection_timeout() -> u64 {
    60
}
