//! Agent registration on the rotating tunnel route.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use axum::{
    extract::{ws::WebSocket, FromRequestParts, Request, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::Reservation;
use super::{error_response, GatewayState};
use crate::auth;
use crate::tunnel::{transport, HandshakeConfig, SessionEvent, TunnelSession};

/// Upgrade the agent's request into the tunnel socket.
///
/// Rejections, in order: not a WebSocket upgrade (400), wrong `sec-auth-key`
/// (403), a tunnel already registered or handshaking (409).
pub(super) async fn register(state: GatewayState, peer: SocketAddr, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let Ok(ws) = WebSocketUpgrade::from_request_parts(&mut parts, &state).await else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "ERR_NOT_WS_CON",
            "The tunnel route only accepts WebSocket upgrades",
        );
    };

    if !auth::secret_matches(state.config.gateway.password.as_deref(), &parts.headers) {
        warn!(peer = %peer, "Rejected agent with invalid auth key");
        return error_response(StatusCode::FORBIDDEN, "ERR_BAD_AUTH", "Invalid auth key");
    }

    let Some(reservation) = state.registry.try_reserve() else {
        warn!(peer = %peer, "Rejected agent: a tunnel is already registered");
        return (
            StatusCode::CONFLICT,
            [(header::CONNECTION, "close")],
            Json(json!({
                "error": "A tunnel is already registered",
                "code": "ERR_TUNNEL_TAKEN",
            })),
        )
            .into_response();
    };

    let handshake = state
        .config
        .tunnel
        .handshake(state.config.gateway.announced_url());
    info!(peer = %peer, "Agent connecting...");

    ws.on_upgrade(move |socket| {
        run_tunnel(socket, state, reservation, handshake)
            .instrument(info_span!("tunnel_agent", peer = %peer))
    })
}

/// Handshake, install the session, then follow its events until it ends.
async fn run_tunnel(
    socket: WebSocket,
    state: GatewayState,
    reservation: Reservation,
    handshake: HandshakeConfig,
) {
    let (sink, stream) = transport::from_axum(socket);
    let (session, mut events) = match TunnelSession::accept(sink, stream, handshake).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(error = %e, "Tunnel handshake failed");
            return;
        }
    };

    let branding = session
        .peer()
        .map(|peer| peer.branding.clone())
        .unwrap_or_default();
    reservation.activate(session.clone());
    info!(branding = %branding, "Tunnel registered");

    let stats = state.registry.stats.clone();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Ended { reason } => {
                info!(%reason, "Tunnel closed");
                break;
            }
            SessionEvent::ConnectionClosed { channel_id, cause } => {
                stats.channels_closed.fetch_add(1, Ordering::Relaxed);
                debug!(channel_id, ?cause, "Channel closed");
            }
            SessionEvent::ConnectionAcknowledged { channel_id } => {
                debug!(channel_id, "Agent acknowledged channel");
            }
            SessionEvent::Ready
            | SessionEvent::ConnectionOpened { .. }
            | SessionEvent::NewConnectionRequested { .. } => {}
        }
    }
    state.registry.release(&session);
}
