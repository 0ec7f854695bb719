//! Client bridges: every public request rides its own channel.
//!
//! Plain HTTP is replayed by a hyper HTTP/1.1 client speaking over the
//! virtual connection. A WebSocket upgrade is first completed upstream with
//! tokio-tungstenite over the virtual connection, then accepted from the
//! client, and messages are relayed both ways until either side closes.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

use axum::{
    body::Body,
    extract::{
        ws::{close_code, CloseFrame, Message as AxumMessage, WebSocket},
        FromRequestParts, Request, WebSocketUpgrade,
    },
    http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    protocol::{frame::coding::CloseCode, CloseFrame as WsCloseFrame},
    Message as WsMessage,
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info_span, warn, Instrument};

use super::{error_response, GatewayState};
use crate::tunnel::{TunnelError, VirtualConnection};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Handshake headers tungstenite writes itself, plus extensions it cannot
/// negotiate.
fn skipped_upstream_header(name: &HeaderName) -> bool {
    [
        header::HOST,
        header::CONNECTION,
        header::UPGRADE,
        header::SEC_WEBSOCKET_KEY,
        header::SEC_WEBSOCKET_VERSION,
        header::SEC_WEBSOCKET_EXTENSIONS,
        header::CONTENT_LENGTH,
    ]
    .contains(name)
}

#[derive(Debug, Error)]
enum BridgeError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("http: {0}")]
    Http(#[from] hyper::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Forward one HTTP request through the tunnel.
pub(super) async fn bridge_http(state: GatewayState, peer: SocketAddr, request: Request) -> Response {
    let connection = match open(&state, peer).await {
        Ok(connection) => connection,
        Err(response) => return response,
    };
    let channel_id = connection.channel_id();
    match forward_http(connection, peer.ip(), request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(channel_id, error = %e, "HTTP bridge failed");
            tunnel_failure(&state)
        }
    }
}

async fn forward_http(
    connection: VirtualConnection,
    client_ip: IpAddr,
    mut request: Request,
) -> Result<Response, BridgeError> {
    let channel_id = connection.channel_id();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(connection)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(channel_id, error = %e, "Bridged HTTP connection ended with error");
        }
    });

    add_forwarded_for(request.headers_mut(), client_ip);
    let response = sender.send_request(request).await?;
    Ok(response.map(Body::new))
}

/// Forward one WebSocket session through the tunnel.
pub(super) async fn bridge_websocket(
    state: GatewayState,
    peer: SocketAddr,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let connection = match open(&state, peer).await {
        Ok(connection) => connection,
        Err(response) => return response,
    };
    let channel_id = connection.channel_id();

    let (upstream, protocol) = match connect_upstream(connection, &parts, peer.ip()).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(channel_id, error = %e, "WebSocket bridge failed");
            return tunnel_failure(&state);
        }
    };

    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };
    ws.on_upgrade(move |socket| {
        relay_websocket(socket, upstream).instrument(info_span!("ws_bridge", channel_id))
    })
}

async fn connect_upstream(
    connection: VirtualConnection,
    parts: &Parts,
    client_ip: IpAddr,
) -> Result<(WebSocketStream<VirtualConnection>, Option<String>), BridgeError> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |p| p.as_str());

    let mut upstream_request = format!("ws://{host}{path}").into_client_request()?;
    let headers = upstream_request.headers_mut();
    for (name, value) in &parts.headers {
        if !skipped_upstream_header(name) {
            headers.append(name, value.clone());
        }
    }
    add_forwarded_for(headers, client_ip);

    let (upstream, response) = tokio_tungstenite::client_async(upstream_request, connection).await?;
    let protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok((upstream, protocol))
}

async fn relay_websocket(client: WebSocket, upstream: WebSocketStream<VirtualConnection>) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let Some(message) = to_upstream(message) else {
                continue;
            };
            let closing = matches!(message, WsMessage::Close(_));
            if upstream_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        loop {
            match upstream_rx.next().await {
                Some(Ok(message)) => {
                    let Some(message) = to_client(message) else {
                        continue;
                    };
                    let closing = matches!(message, AxumMessage::Close(_));
                    if client_tx.send(message).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Upstream WebSocket failed");
                    let _ = client_tx
                        .send(AxumMessage::Close(Some(CloseFrame {
                            code: close_code::ERROR,
                            reason: "upstream failure".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            }
        }
    };

    tokio::select! {
        () = client_to_upstream => debug!("Client side of bridged WebSocket finished"),
        () = upstream_to_client => debug!("Upstream side of bridged WebSocket finished"),
    }
}

// Both WebSocket stacks answer pings on their own, so pings are relayed and
// pongs are not; relaying them too would double every reply.

fn to_upstream(message: AxumMessage) -> Option<WsMessage> {
    Some(match message {
        AxumMessage::Text(text) => WsMessage::text(text.as_str().to_owned()),
        AxumMessage::Binary(data) => WsMessage::Binary(data),
        AxumMessage::Ping(data) => WsMessage::Ping(data),
        AxumMessage::Pong(_) => return None,
        AxumMessage::Close(frame) => WsMessage::Close(frame.map(|frame| WsCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
    })
}

fn to_client(message: WsMessage) -> Option<AxumMessage> {
    Some(match message {
        WsMessage::Text(text) => AxumMessage::Text(text.as_str().to_owned().into()),
        WsMessage::Binary(data) => AxumMessage::Binary(data),
        WsMessage::Ping(data) => AxumMessage::Ping(data),
        WsMessage::Pong(_) => return None,
        WsMessage::Close(frame) => AxumMessage::Close(frame.map(|frame| CloseFrame {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
        WsMessage::Frame(_) => return None,
    })
}

/// Open a channel for `peer`, or the 502 to answer with.
async fn open(state: &GatewayState, peer: SocketAddr) -> Result<VirtualConnection, Response> {
    match state
        .registry
        .allocate_virtual_connection(peer.ip(), peer.port())
        .await
    {
        Ok(connection) => Ok(connection),
        Err(TunnelError::NoActiveSession) => Err(error_response(
            StatusCode::BAD_GATEWAY,
            "ERR_NO_TUNNEL",
            "No tunnel is registered",
        )),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Could not open tunnel channel");
            Err(tunnel_failure(state))
        }
    }
}

fn tunnel_failure(state: &GatewayState) -> Response {
    state
        .registry
        .stats
        .bridge_failures
        .fetch_add(1, Ordering::Relaxed);
    error_response(
        StatusCode::BAD_GATEWAY,
        "ERR_TUNNEL_FAILURE",
        "The tunnel could not reach the service",
    )
}

/// Append the client address to `x-forwarded-for`.
fn add_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
