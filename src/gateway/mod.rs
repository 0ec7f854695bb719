//! Public side: accepts the agent's tunnel and bridges clients through it.
//!
//! Every request lands in one fallback handler which picks a route:
//!
//! | Request                                   | Handling                        |
//! |-------------------------------------------|---------------------------------|
//! | `{tunnel.path}/{bucket}`                  | Agent registration (`register`) |
//! | `gateway.health_path` (when configured)   | JSON status document            |
//! | any other WebSocket upgrade               | WS bridge over a channel        |
//! | anything else                             | HTTP bridge over a channel      |
//!
//! - `registry` - the single tunnel slot and gateway counters
//! - `register` - tunnel upgrade, auth, handshake, event pump
//! - `bridge` - HTTP/1.1 and WebSocket bridges onto virtual connections

pub mod bridge;
pub mod register;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::config::Config;

pub use registry::{Reservation, TunnelRegistry, TunnelStats};

/// State shared by every gateway handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub registry: TunnelRegistry,
    /// Monotonic instant when the gateway started (for uptime).
    pub start_time: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            registry: TunnelRegistry::new(),
            start_time: Instant::now(),
        }
    }
}

/// Build the gateway router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .fallback(route_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn route_request(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let path = request.uri().path();
    if auth::is_tunnel_route(&state.config.tunnel.path, path, SystemTime::now()) {
        return register::register(state, peer, request).await;
    }
    if state.config.gateway.health_path.as_deref() == Some(path) {
        return Json(health(&state)).into_response();
    }
    if is_websocket_upgrade(request.headers()) {
        bridge::bridge_websocket(state, peer, request).await
    } else {
        bridge::bridge_http(state, peer, request).await
    }
}

/// JSON status: tunnel presence, open channels, counters, uptime.
pub fn health(state: &GatewayState) -> Value {
    let tunnel = match state.registry.current() {
        Some(session) => json!({
            "registered": true,
            "branding": session.peer().map(|peer| peer.branding.clone()),
            "open_channels": session.channel_count(),
            "awaiting_ack": session.awaiting_ack_count(),
        }),
        None => json!({ "registered": false }),
    };
    let counters: serde_json::Map<String, Value> = state
        .registry
        .stats
        .snapshot()
        .into_iter()
        .map(|(name, value)| (name.to_string(), Value::from(value)))
        .collect();
    json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "tunnel": tunnel,
        "counters": counters,
    })
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

/// `{"error": ..., "code": ...}` with `status`.
pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}
