//! Private side: dials the gateway and serves the channels it opens.
//!
//! Spawned by `forwarder agent`. Maintains one tunnel to the gateway with
//! exponential-backoff reconnect and hands every `NewConnection` to the
//! [`LocalDialer`].

pub mod dialer;

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::tunnel::{transport, SessionEvent, TunnelSession};

pub use dialer::LocalDialer;

type BoxError = Box<dyn Error + Send + Sync>;

/// Spawn the agent loop. Returns a `JoinHandle` that runs until cancelled, or
/// until the first session ends when `agent.reconnect` is off.
pub fn spawn(config: Arc<Config>) -> JoinHandle<Result<(), BoxError>> {
    tokio::spawn(run(config))
}

/// Main loop: connect, serve channels, reconnect on failure.
///
/// Only returns when `agent.reconnect` is false: `Ok` if the session reached
/// READY before it ended, the connection error otherwise.
pub async fn run(config: Arc<Config>) -> Result<(), BoxError> {
    let agent = &config.agent;
    let initial_delay = Duration::from_secs(agent.reconnect_delay_secs);
    let max_delay = Duration::from_secs(agent.reconnect_max_delay_secs);
    let mut delay = initial_delay;

    loop {
        info!("Connecting to gateway at {}", agent.gateway_url);
        match connect_and_run(&config).await {
            Ok(reason) => {
                info!(%reason, "Tunnel closed");
                if !agent.reconnect {
                    return Ok(());
                }
                delay = initial_delay;
            }
            Err(e) => {
                if !agent.reconnect {
                    return Err(e);
                }
                warn!("Tunnel connection error: {e}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, max_delay);
    }
}

fn next_delay(delay: Duration, max_delay: Duration) -> Duration {
    (delay * 2).min(max_delay)
}

/// Tunnel URL for `now`: gateway base URL plus the rotating route.
pub fn tunnel_url(config: &Config, now: SystemTime) -> String {
    format!(
        "{}{}",
        config.agent.gateway_url.trim_end_matches('/'),
        auth::tunnel_route(&config.tunnel.path, auth::route_bucket(now))
    )
}

/// A single connection attempt: connect, handshake, serve channels until the
/// session ends. Returns the end reason once the session was READY.
async fn connect_and_run(config: &Config) -> Result<String, BoxError> {
    let mut request = tunnel_url(config, SystemTime::now()).into_client_request()?;
    let key = config.agent.password.as_deref().unwrap_or(auth::NO_PASSWORD);
    request
        .headers_mut()
        .insert(auth::AUTH_HEADER, HeaderValue::from_str(key)?);

    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    let (sink, stream) = transport::from_tungstenite(socket);
    let (session, mut events) =
        TunnelSession::initiate(sink, stream, config.tunnel.handshake(String::new())).await?;

    if let Some(peer) = session.peer() {
        info!(gateway = %peer.branding, url = %peer.url, "Tunnel ready");
    }

    let dialer = LocalDialer::new(
        config.agent.service.clone(),
        Duration::from_secs(config.agent.connect_timeout_secs),
    );
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::NewConnectionRequested {
                channel_id,
                ip,
                port,
                connection,
            } => {
                debug!(channel_id, client_ip = %ip, client_port = port, "New connection");
                dialer.spawn(connection, ip, port);
            }
            SessionEvent::ConnectionClosed { channel_id, cause } => {
                debug!(channel_id, ?cause, "Channel closed");
            }
            SessionEvent::Ended { reason } => return Ok(reason),
            SessionEvent::Ready
            | SessionEvent::ConnectionOpened { .. }
            | SessionEvent::ConnectionAcknowledged { .. } => {}
        }
    }
    Ok("event queue closed".to_string())
}
