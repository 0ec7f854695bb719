//! Tunnel multiplexing protocol.
//!
//! One physical WebSocket, opened outbound by the agent, carries any number
//! of logical channels. Channel 0 is reserved for control packets; every
//! other channel is a [`VirtualConnection`] standing in for a real socket on
//! the side that did not originate it.
//!
//! - `codec` - varints, strings, byte arrays, bulk field codec, frame envelope
//! - `packet` - control packets and their per-direction id tables
//! - `reassembler` - frame boundaries from an arbitrarily chopped message stream
//! - `allocator` - channel id free pool
//! - `session` - handshake, channel table, dispatcher, writer, lifecycle events
//! - `connection` - per-channel byte stream
//! - `transport` - WebSocket adapters for the physical socket

pub mod allocator;
pub mod codec;
pub mod connection;
pub mod packet;
pub mod reassembler;
pub mod session;
pub mod transport;

use std::time::Duration;

use thiserror::Error;

pub use codec::{CodecError, Frame};
pub use connection::VirtualConnection;
pub use packet::{ControlPacket, Direction, IdentifyFailureReason, Phase};
pub use reassembler::FrameReassembler;
pub use session::{
    CloseCause, HandshakeConfig, PeerIdentity, Role, SessionEvent, SessionEvents, SessionState,
    TunnelSession,
};
pub use transport::{FrameSink, FrameStream, TransportError};

/// Protocol version announced in `Identify` and checked by the gateway.
pub const PROTOCOL_VERSION: u32 = 1;

/// Channel carrying control packets.
pub const CONTROL_CHANNEL: u32 = 0;

pub const DEFAULT_BRANDING: &str = "forwarder";

/// Largest payload put in one data frame; longer writes are split.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol version mismatch: expected {expected}, peer sent {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    #[error("gateway rejected identify: {0}")]
    IdentifyRejected(IdentifyFailureReason),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("channel {0} is closed")]
    ChannelClosed(u32),

    #[error("no open channel {0}")]
    UnknownChannel(u32),

    #[error("no tunnel is registered")]
    NoActiveSession,

    #[error("channel ids exhausted")]
    ChannelsExhausted,

    #[error("tunnel session has ended")]
    SessionEnded,

    #[error("unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("unknown control packet id {0:#04x}")]
    UnknownPacket(u64),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for TunnelError {
    fn from(e: CodecError) -> Self {
        TunnelError::MalformedFrame(e.to_string())
    }
}
