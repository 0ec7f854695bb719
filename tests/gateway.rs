//! Gateway + agent + backend over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};

use forwarder::config::Config;
use forwarder::gateway::{self, GatewayState};
use forwarder::{agent, auth};

const WAIT: Duration = Duration::from_secs(10);
const PASSWORD: &str = "s3cret";

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// The service behind NAT.
async fn spawn_backend() -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { "hello from behind NAT" }))
        .route("/echo", post(|body: String| async move { body }))
        .route(
            "/forwarded",
            get(|headers: HeaderMap| async move {
                headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo).into_response() }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn test_config(backend: SocketAddr) -> Config {
    let mut config = Config::default();
    config.gateway.password = Some(PASSWORD.into());
    config.gateway.health_path = Some("/_health".into());
    config.agent.password = Some(PASSWORD.into());
    config.agent.service = backend.to_string();
    config.agent.reconnect_delay_secs = 1;
    config.tunnel.handshake_timeout_secs = 5;
    config
}

async fn spawn_gateway(config: Config) -> (SocketAddr, GatewayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = GatewayState::new(Arc::new(config));
    let app = gateway::router(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

/// Backend, gateway and a registered agent.
async fn spawn_stack() -> (SocketAddr, GatewayState, tokio::task::JoinHandle<Result<(), Box<dyn std::error::Error + Send + Sync>>>) {
    let backend = spawn_backend().await;
    let mut config = test_config(backend);
    let (gateway_addr, state) = spawn_gateway(config.clone()).await;

    config.agent.gateway_url = format!("ws://{gateway_addr}");
    let agent = agent::spawn(Arc::new(config));

    tokio::time::timeout(WAIT, async {
        while !state.registry.is_registered() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never registered");
    (gateway_addr, state, agent)
}

async fn http(addr: SocketAddr, request: Request<Full<Bytes>>) -> (StatusCode, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let response = tokio::time::timeout(WAIT, sender.send_request(request))
        .await
        .unwrap()
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn get_request(path: &str) -> Request<Full<Bytes>> {
    Request::get(path)
        .header(header::HOST, "forwarder.test")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn current_tunnel_route() -> String {
    auth::tunnel_route("/gateway", auth::route_bucket(SystemTime::now()))
}

async fn register_raw(gateway: SocketAddr, key: &str) -> Result<(), StatusCode> {
    let mut request = format!("ws://{gateway}{}", current_tunnel_route())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(auth::AUTH_HEADER, HeaderValue::from_str(key).unwrap());
    match tokio_tungstenite::connect_async(request).await {
        Ok(_) => Ok(()),
        Err(tungstenite::Error::Http(response)) => Err(response.status()),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[tokio::test]
async fn request_without_tunnel_is_bad_gateway() {
    let (gateway, _state) = spawn_gateway(test_config("127.0.0.1:9".parse().unwrap())).await;
    let (status, body) = http(gateway, get_request("/hello")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["code"], "ERR_NO_TUNNEL");
}

#[tokio::test]
async fn plain_request_on_tunnel_route_is_rejected() {
    let (gateway, _state) = spawn_gateway(test_config("127.0.0.1:9".parse().unwrap())).await;
    let (status, body) = http(gateway, get_request(&current_tunnel_route())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["code"], "ERR_NOT_WS_CON");
}

#[tokio::test]
async fn wrong_password_is_forbidden() {
    let (gateway, state) = spawn_gateway(test_config("127.0.0.1:9".parse().unwrap())).await;
    assert_eq!(
        register_raw(gateway, "wrong").await,
        Err(StatusCode::FORBIDDEN)
    );
    assert!(!state.registry.is_registered());
}

#[tokio::test]
async fn http_round_trip_through_tunnel() {
    let (gateway, _state, agent) = spawn_stack().await;

    let (status, body) = http(gateway, get_request("/hello")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello from behind NAT");

    let post = Request::post("/echo")
        .header(header::HOST, "forwarder.test")
        .body(Full::new(Bytes::from("ping through the tunnel")))
        .unwrap();
    let (status, body) = http(gateway, post).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ping through the tunnel");

    let (_, forwarded) = http(gateway, get_request("/forwarded")).await;
    assert_eq!(forwarded, "127.0.0.1");

    agent.abort();
}

#[tokio::test]
async fn websocket_round_trip_through_tunnel() {
    let (gateway, _state, agent) = spawn_stack().await;

    let (mut socket, _) = tokio::time::timeout(
        WAIT,
        tokio_tungstenite::connect_async(format!("ws://{gateway}/ws")),
    )
    .await
    .unwrap()
    .unwrap();
    socket.send(WsMessage::text("hello")).await.unwrap();
    let reply = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, WsMessage::text("hello"));

    socket
        .send(WsMessage::Binary(Bytes::from_static(&[1, 2, 3])))
        .await
        .unwrap();
    let reply = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, WsMessage::Binary(Bytes::from_static(&[1, 2, 3])));

    agent.abort();
}

#[tokio::test]
async fn second_registration_is_conflict() {
    let (gateway, state, agent) = spawn_stack().await;
    assert_eq!(
        register_raw(gateway, PASSWORD).await,
        Err(StatusCode::CONFLICT)
    );
    assert!(state.registry.is_registered());
    agent.abort();
}

#[tokio::test]
async fn health_reports_registered_tunnel() {
    let (gateway, _state, agent) = spawn_stack().await;
    let (status, body) = http(gateway, get_request("/_health")).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["tunnel"]["registered"], true);
    assert_eq!(body["tunnel"]["branding"], "forwarder");
    assert_eq!(body["counters"]["registrations"], 1);
    agent.abort();
}

#[tokio::test]
async fn unreachable_service_is_tunnel_failure() {
    let backend = spawn_backend().await;
    let mut config = test_config(backend);
    // Nothing listens on port 9 on loopback.
    config.agent.service = "127.0.0.1:9".into();
    let (gateway_addr, state) = spawn_gateway(config.clone()).await;
    config.agent.gateway_url = format!("ws://{gateway_addr}");
    let agent = agent::spawn(Arc::new(config));
    tokio::time::timeout(WAIT, async {
        while !state.registry.is_registered() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (status, body) = http(gateway_addr, get_request("/hello")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["code"], "ERR_TUNNEL_FAILURE");
    agent.abort();
}
