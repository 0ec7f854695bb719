//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** - `FORWARDER_PASSWORD`, `FORWARDER_LISTEN`,
//!    `FORWARDER_GATEWAY_URL`, `FORWARDER_SERVICE`
//! 2. **Config file** - path via `--config <path>`, or `forwarder.toml` in CWD
//! 3. **Compiled defaults** - see each field's default value below
//!
//! One file can describe both ends; each subcommand reads its own section
//! plus `[tunnel]` and `[logging]`:
//!
//! ```toml
//! [gateway]
//! listen = "0.0.0.0:8080"
//! password = "shared-secret"                 # omit to accept any agent
//! public_url = "https://tunnel.example.com/" # announced to the agent
//! health_path = "/_forwarder/health"         # omit to bridge every path
//!
//! [agent]
//! gateway_url = "wss://tunnel.example.com"
//! password = "shared-secret"
//! service = "127.0.0.1:3000"                 # local service behind NAT
//! connect_timeout_secs = 10
//! reconnect = true
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//!
//! [tunnel]
//! path = "/gateway"
//! branding = "forwarder"
//! handshake_timeout_secs = 30
//! channel_buffer = 64
//! write_queue = 256
//! stall_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::tunnel::{HandshakeConfig, DEFAULT_BRANDING, PROTOCOL_VERSION};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "forwarder.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public side: HTTP listener and tunnel registration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Shared secret the agent must present in `sec-auth-key`. Override with
    /// `FORWARDER_PASSWORD`. `None` accepts any agent (startup warning).
    pub password: Option<String>,
    /// URL announced in `IdentifySuccess`. Defaults to `http://{listen}/`.
    pub public_url: Option<String>,
    /// Serve a JSON status document here instead of bridging the path.
    pub health_path: Option<String>,
}

/// Private side: where the gateway is and what to expose.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Gateway base URL, `ws://` or `wss://` (default `ws://127.0.0.1:8080`).
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Shared secret sent as `sec-auth-key`. Override with `FORWARDER_PASSWORD`.
    pub password: Option<String>,
    /// Local service every channel is dialed to (default `127.0.0.1:3000`).
    #[serde(default = "default_service")]
    pub service: String,
    /// Seconds to wait for the local service to accept (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reconnect after the tunnel drops (default true). When false the agent
    /// exits once its session ends.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// Settings both ends must agree on, plus per-session buffer sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Route prefix of the tunnel upgrade (default `/gateway`).
    #[serde(default = "default_tunnel_path")]
    pub path: String,
    /// Name announced in the handshake (default `forwarder`).
    #[serde(default = "default_branding")]
    pub branding: String,
    /// Seconds allowed for the handshake (default 30).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Inbound chunks buffered per channel (default 64).
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
    /// Outbound frames queued per session (default 256).
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
    /// Seconds a channel may leave its inbound queue full before it is
    /// closed (default 10).
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_gateway_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}
fn default_service() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_reconnect() -> bool {
    true
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_tunnel_path() -> String {
    "/gateway".to_string()
}
fn default_branding() -> String {
    DEFAULT_BRANDING.to_string()
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_channel_buffer() -> usize {
    64
}
fn default_write_queue() -> usize {
    256
}
fn default_stall_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            password: None,
            public_url: None,
            health_path: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            password: None,
            service: default_service(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: default_reconnect(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            path: default_tunnel_path(),
            branding: default_branding(),
            handshake_timeout_secs: default_handshake_timeout(),
            channel_buffer: default_channel_buffer(),
            write_queue: default_write_queue(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GatewayConfig {
    /// URL announced to the agent in `IdentifySuccess`.
    pub fn announced_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/", self.listen))
    }
}

impl TunnelConfig {
    /// Handshake parameters for a session; `url` is only sent by the gateway.
    pub fn handshake(&self, url: String) -> HandshakeConfig {
        HandshakeConfig {
            protocol_version: PROTOCOL_VERSION,
            branding: self.branding.clone(),
            url,
            timeout: Duration::from_secs(self.handshake_timeout_secs),
            channel_buffer: self.channel_buffer,
            write_queue: self.write_queue,
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `forwarder.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };

        // Env var overrides
        if let Ok(password) = std::env::var("FORWARDER_PASSWORD") {
            config.gateway.password = Some(password.clone());
            config.agent.password = Some(password);
        }
        if let Ok(listen) = std::env::var("FORWARDER_LISTEN") {
            config.gateway.listen = listen;
        }
        if let Ok(url) = std::env::var("FORWARDER_GATEWAY_URL") {
            config.agent.gateway_url = url;
        }
        if let Ok(service) = std::env::var("FORWARDER_SERVICE") {
            config.agent.service = service;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
