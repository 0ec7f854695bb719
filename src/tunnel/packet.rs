//! Control packets carried on channel 0.
//!
//! Packet ids are only unique within a (phase, direction) pair: `0x00` is
//! `Identify` when the agent speaks during the handshake, `IdentifySuccess`
//! when the gateway answers, and `NewConnection` once the session is ready.
//!
//! | Phase     | Direction | Id   | Packet              |
//! |-----------|-----------|------|---------------------|
//! | handshake | to gateway| 0x00 | `Identify`          |
//! | handshake | to agent  | 0x00 | `IdentifySuccess`   |
//! | handshake | to agent  | 0x01 | `IdentifyFailure`   |
//! | ready     | to agent  | 0x00 | `NewConnection`     |
//! | ready     | to agent  | 0x01 | `ConnectionEnd`     |
//! | ready     | to gateway| 0x00 | `ConnectionEnd`     |
//! | ready     | to gateway| 0x01 | `AckConnectionOpen` |
//! | ready     | to gateway| 0x02 | `AckConnectionClose`|

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::codec::{self, CodecError, Field, FieldKind};
use super::{TunnelError, CONTROL_CHANNEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Ready,
}

/// Which peer a packet travels towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToGateway,
    ToAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyFailureReason {
    BadVersion,
}

impl IdentifyFailureReason {
    pub fn code(self) -> u64 {
        match self {
            IdentifyFailureReason::BadVersion => 0,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(IdentifyFailureReason::BadVersion),
            _ => None,
        }
    }
}

impl fmt::Display for IdentifyFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifyFailureReason::BadVersion => f.write_str("BAD_VERSION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    Identify {
        protocol_version: u32,
        branding: String,
    },
    IdentifySuccess {
        branding: String,
        protocol_version: u32,
        url: String,
    },
    IdentifyFailure {
        reason: IdentifyFailureReason,
    },
    NewConnection {
        ip: String,
        port: u16,
        channel_id: u32,
    },
    ConnectionEnd {
        channel_id: u32,
    },
    AckConnectionOpen {
        channel_id: u32,
    },
    AckConnectionClose {
        channel_id: u32,
    },
}

const IDENTIFY: &[FieldKind] = &[FieldKind::VarInt, FieldKind::String];
const IDENTIFY_SUCCESS: &[FieldKind] = &[FieldKind::String, FieldKind::VarInt, FieldKind::String];
const NEW_CONNECTION: &[FieldKind] = &[FieldKind::String, FieldKind::VarInt, FieldKind::VarInt];
const SINGLE_VARINT: &[FieldKind] = &[FieldKind::VarInt];

impl ControlPacket {
    pub fn phase(&self) -> Phase {
        match self {
            ControlPacket::Identify { .. }
            | ControlPacket::IdentifySuccess { .. }
            | ControlPacket::IdentifyFailure { .. } => Phase::Handshake,
            _ => Phase::Ready,
        }
    }

    /// Wire id of this packet when sent in `direction`, or `None` if the
    /// packet never travels that way.
    pub fn packet_id(&self, direction: Direction) -> Option<u64> {
        use ControlPacket as P;
        use Direction::{ToAgent, ToGateway};

        match (self, direction) {
            (P::Identify { .. }, ToGateway)
            | (P::IdentifySuccess { .. } | P::NewConnection { .. }, ToAgent)
            | (P::ConnectionEnd { .. }, ToGateway) => Some(0x00),
            (P::IdentifyFailure { .. } | P::ConnectionEnd { .. }, ToAgent)
            | (P::AckConnectionOpen { .. }, ToGateway) => Some(0x01),
            (P::AckConnectionClose { .. }, ToGateway) => Some(0x02),
            _ => None,
        }
    }

    fn fields(&self) -> Vec<Field> {
        match self {
            ControlPacket::Identify {
                protocol_version,
                branding,
            } => vec![
                Field::VarInt(u64::from(*protocol_version)),
                Field::String(branding.clone()),
            ],
            ControlPacket::IdentifySuccess {
                branding,
                protocol_version,
                url,
            } => vec![
                Field::String(branding.clone()),
                Field::VarInt(u64::from(*protocol_version)),
                Field::String(url.clone()),
            ],
            ControlPacket::IdentifyFailure { reason } => vec![Field::VarInt(reason.code())],
            ControlPacket::NewConnection {
                ip,
                port,
                channel_id,
            } => vec![
                Field::String(ip.clone()),
                Field::VarInt(u64::from(*port)),
                Field::VarInt(u64::from(*channel_id)),
            ],
            ControlPacket::ConnectionEnd { channel_id }
            | ControlPacket::AckConnectionOpen { channel_id }
            | ControlPacket::AckConnectionClose { channel_id } => {
                vec![Field::VarInt(u64::from(*channel_id))]
            }
        }
    }

    /// Encode as a control payload: `varint(packetId) fields...`.
    pub fn encode(&self, direction: Direction) -> Result<Bytes, TunnelError> {
        let id = self.packet_id(direction).ok_or_else(|| {
            TunnelError::UnexpectedPacket(format!("{self:?} cannot be sent {direction:?}"))
        })?;
        let mut buf = BytesMut::new();
        codec::encode_varint(id, &mut buf);
        codec::encode_fields(&self.fields(), &mut buf);
        Ok(buf.freeze())
    }

    /// Encode and wrap in a channel-0 frame.
    pub fn to_frame(&self, direction: Direction) -> Result<Bytes, TunnelError> {
        Ok(codec::encode_frame(CONTROL_CHANNEL, &self.encode(direction)?))
    }

    /// Decode a control payload received in `phase`, travelling `direction`.
    ///
    /// Unknown ids yield [`TunnelError::UnknownPacket`] so the caller can skip
    /// them; anything else that fails to parse is [`TunnelError::MalformedFrame`].
    /// Trailing bytes after the last field are ignored.
    pub fn decode(phase: Phase, direction: Direction, payload: Bytes) -> Result<Self, TunnelError> {
        let mut src = payload;
        let id = codec::get_varint(&mut src).map_err(|e| match e {
            CodecError::Incomplete => TunnelError::MalformedFrame("empty control payload".into()),
            CodecError::Malformed(reason) => {
                TunnelError::MalformedFrame(format!("control packet id: {reason}"))
            }
        })?;

        let schema = match (phase, direction, id) {
            (Phase::Handshake, Direction::ToGateway, 0x00) => IDENTIFY,
            (Phase::Handshake, Direction::ToAgent, 0x00) => IDENTIFY_SUCCESS,
            (Phase::Ready, Direction::ToAgent, 0x00) => NEW_CONNECTION,
            (Phase::Handshake, Direction::ToAgent, 0x01)
            | (Phase::Ready, Direction::ToAgent, 0x01)
            | (Phase::Ready, Direction::ToGateway, 0x00..=0x02) => SINGLE_VARINT,
            _ => return Err(TunnelError::UnknownPacket(id)),
        };
        let mut fields = codec::decode_fields(&mut src, schema)?.into_iter();
        let mut next = move || fields.next().ok_or_else(|| malformed("missing field"));

        Ok(match (phase, direction, id) {
            (Phase::Handshake, Direction::ToGateway, _) => ControlPacket::Identify {
                protocol_version: as_u32(next()?, "protocol version")?,
                branding: as_string(next()?)?,
            },
            (Phase::Handshake, Direction::ToAgent, 0x00) => ControlPacket::IdentifySuccess {
                branding: as_string(next()?)?,
                protocol_version: as_u32(next()?, "protocol version")?,
                url: as_string(next()?)?,
            },
            (Phase::Handshake, Direction::ToAgent, _) => {
                let code = as_u64(next()?)?;
                let reason = IdentifyFailureReason::from_code(code)
                    .ok_or_else(|| malformed(&format!("unknown identify failure reason {code}")))?;
                ControlPacket::IdentifyFailure { reason }
            }
            (Phase::Ready, Direction::ToAgent, 0x00) => {
                let ip = as_string(next()?)?;
                let port = as_u64(next()?)?;
                let port = u16::try_from(port)
                    .map_err(|_| malformed(&format!("port {port} out of range")))?;
                ControlPacket::NewConnection {
                    ip,
                    port,
                    channel_id: as_u32(next()?, "channel id")?,
                }
            }
            (Phase::Ready, Direction::ToAgent, _) | (Phase::Ready, Direction::ToGateway, 0x00) => {
                ControlPacket::ConnectionEnd {
                    channel_id: as_u32(next()?, "channel id")?,
                }
            }
            (Phase::Ready, Direction::ToGateway, 0x01) => ControlPacket::AckConnectionOpen {
                channel_id: as_u32(next()?, "channel id")?,
            },
            (Phase::Ready, Direction::ToGateway, _) => ControlPacket::AckConnectionClose {
                channel_id: as_u32(next()?, "channel id")?,
            },
        })
    }
}

fn malformed(reason: &str) -> TunnelError {
    TunnelError::MalformedFrame(reason.to_string())
}

fn as_u64(field: Field) -> Result<u64, TunnelError> {
    match field {
        Field::VarInt(value) => Ok(value),
        other => Err(malformed(&format!("expected varint, got {:?}", other.kind()))),
    }
}

fn as_u32(field: Field, what: &str) -> Result<u32, TunnelError> {
    let value = as_u64(field)?;
    u32::try_from(value).map_err(|_| malformed(&format!("{what} {value} out of range")))
}

fn as_string(field: Field) -> Result<String, TunnelError> {
    match field {
        Field::String(value) => Ok(value),
        other => Err(malformed(&format!("expected string, got {:?}", other.kind()))),
    }
}
