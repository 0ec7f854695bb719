//! Physical socket adapters.
//!
//! A session only needs a sink of outgoing binary messages and a stream of
//! incoming ones. Both WebSocket flavours in use (axum on the gateway,
//! tokio-tungstenite on the agent) are narrowed to that shape here: binary
//! messages pass through, ping/pong are left to the WebSocket layer, a close
//! frame ends the stream, and a text message is a protocol error.

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket closed")]
    Closed,
    #[error("text message on tunnel socket")]
    NonBinary,
    #[error("websocket: {0}")]
    WebSocket(String),
}

impl From<axum::Error> for TransportError {
    fn from(e: axum::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

impl From<WsError> for TransportError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Outgoing half of a physical tunnel socket.
pub trait FrameSink: Sink<Bytes, Error = TransportError> + Send + Unpin + 'static {}

impl<T> FrameSink for T where T: Sink<Bytes, Error = TransportError> + Send + Unpin + 'static {}

/// Incoming half of a physical tunnel socket. Ends when the peer closes.
pub trait FrameStream: Stream<Item = Result<Bytes, TransportError>> + Send + Unpin + 'static {}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Bytes, TransportError>> + Send + Unpin + 'static
{
}

/// Split an upgraded axum WebSocket into tunnel halves.
pub fn from_axum(socket: WebSocket) -> (impl FrameSink, impl FrameStream) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, TransportError>(AxumMessage::Binary(frame))));
    let stream = stream
        .take_while(|message| future::ready(!matches!(message, Ok(AxumMessage::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(AxumMessage::Binary(data)) => Some(Ok(data)),
                Ok(AxumMessage::Text(_)) => Some(Err(TransportError::NonBinary)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
    (sink, stream)
}

/// Split a tokio-tungstenite client socket into tunnel halves.
pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> (impl FrameSink, impl FrameStream)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Bytes| future::ready(Ok::<_, TransportError>(WsMessage::Binary(frame))));
    let stream = stream
        .take_while(|message| future::ready(!matches!(message, Ok(WsMessage::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Binary(data)) => Some(Ok(data)),
                Ok(WsMessage::Text(_)) => Some(Err(TransportError::NonBinary)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
    (sink, stream)
}
