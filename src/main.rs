#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # forwarder
//!
//! Expose a TCP service that sits behind NAT through one multiplexed
//! WebSocket tunnel.
//!
//! ## Subcommands
//!
//! - `forwarder gateway` - run the public side: accepts the agent's tunnel on
//!   `{tunnel.path}/{bucket}` and bridges every other HTTP/WS request through it
//! - `forwarder agent` - run the private side: dials the gateway and connects
//!   each channel it opens to `agent.service`
//!
//! ## Architecture
//!
//! ```text
//! main.rs          - entry point, clap subcommands, graceful shutdown
//! auth.rs          - sec-auth-key check, rotating tunnel route
//! config.rs        - TOML + env-var configuration
//! tunnel/
//!   codec.rs       - varints, strings, bulk field codec, frame envelope
//!   packet.rs      - control packets, per-direction id tables
//!   reassembler.rs - frame boundaries across WebSocket messages
//!   allocator.rs   - channel id free pool
//!   session.rs     - handshake, channel table, dispatcher, writer, events
//!   connection.rs  - VirtualConnection (AsyncRead + AsyncWrite)
//!   transport.rs   - axum / tokio-tungstenite socket adapters
//! gateway/
//!   mod.rs         - router, health, request routing
//!   registry.rs    - single tunnel slot, counters
//!   register.rs    - agent registration and session event pump
//!   bridge.rs      - HTTP/1.1 and WebSocket bridges
//! agent/
//!   mod.rs         - reconnect loop, session event pump
//!   dialer.rs      - local service dialer
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use forwarder::config::Config;
use forwarder::gateway::{self, GatewayState};
use forwarder::{agent, auth};

/// Expose a service behind NAT through a multiplexed WebSocket tunnel.
#[derive(Parser)]
#[command(name = "forwarder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public gateway.
    Gateway {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the private agent next to the service to expose.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Gateway { config } | Commands::Agent { config } => config.as_deref(),
    };
    let config = match Config::load(config_path) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("forwarder: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("forwarder v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Gateway { .. } => run_gateway(config).await,
        Commands::Agent { .. } => run_agent(config).await,
    }
}

async fn run_gateway(config: Arc<Config>) -> ExitCode {
    let gateway = &config.gateway;
    let password = if gateway.password.is_some() { "<redacted>" } else { "<none>" };
    info!(
        listen = %gateway.listen,
        public_url = %gateway.announced_url(),
        tunnel_path = %config.tunnel.path,
        health_path = gateway.health_path.as_deref().unwrap_or("-"),
        password,
        "Gateway configuration"
    );
    if gateway.password.is_none() {
        warn!("No gateway password set, any agent can register. Set FORWARDER_PASSWORD or update config");
    }

    let listener = match TcpListener::bind(&gateway.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", gateway.listen);
            return ExitCode::FAILURE;
        }
    };

    let state = GatewayState::new(config.clone());
    let registry = state.registry.clone();
    let app = gateway::router(state);

    info!("Gateway ready");
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        registry.shutdown();
    })
    .await;

    info!("Goodbye");
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_agent(config: Arc<Config>) -> ExitCode {
    let agent_config = &config.agent;
    let password = if agent_config.password.is_some() { "<redacted>" } else { auth::NO_PASSWORD };
    info!(
        gateway_url = %agent_config.gateway_url,
        service = %agent_config.service,
        tunnel_path = %config.tunnel.path,
        reconnect = agent_config.reconnect,
        password,
        "Agent configuration"
    );
    if agent_config.password.is_none() {
        warn!("No agent password set, sending {}", auth::NO_PASSWORD);
    }

    tokio::select! {
        outcome = agent::run(config.clone()) => match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Agent stopped: {e}");
                ExitCode::FAILURE
            }
        },
        () = shutdown_signal() => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
