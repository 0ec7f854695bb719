//! Wire codec for the tunnel protocol.
//!
//! Everything on the wire is built from unsigned LEB128 varints:
//!
//! ```text
//! Frame          := varint(frameLen) body
//! body           := varint(channelId) payload      (frameLen bytes)
//! string / bytes := varint(len) raw
//! ```
//!
//! Varint decoding distinguishes [`CodecError::Incomplete`] (wait for more
//! bytes) from [`CodecError::Malformed`] (the stream is corrupt). The bulk
//! codec ([`encode_fields`] / [`decode_fields`]) works on complete buffers, so
//! there a short read is always reported as malformed.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest valid encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("insufficient bytes")]
    Incomplete,
    #[error("{0}")]
    Malformed(String),
}

// ─── Varints ────────────────────────────────────────────────────────

pub fn encode_varint(value: u64, buf: &mut impl BufMut) {
    let mut value = value;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Number of bytes [`encode_varint`] writes for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Decode a varint from the front of `src` without consuming it.
///
/// Returns the value and the number of bytes it occupies.
pub fn decode_varint(src: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        // The tenth byte may only carry the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(CodecError::Malformed("varint overflows 64 bits".into()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::Incomplete)
}

/// Consume a varint from the front of `src`.
pub fn get_varint(src: &mut Bytes) -> Result<u64, CodecError> {
    let (value, len) = decode_varint(src)?;
    src.advance(len);
    Ok(value)
}

// ─── Strings and byte arrays ────────────────────────────────────────

pub fn put_bytes(value: &[u8], buf: &mut BytesMut) {
    encode_varint(value.len() as u64, buf);
    buf.put_slice(value);
}

pub fn put_string(value: &str, buf: &mut BytesMut) {
    put_bytes(value.as_bytes(), buf);
}

pub fn get_bytes(src: &mut Bytes) -> Result<Bytes, CodecError> {
    let (len, header) = decode_varint(src)?;
    let len = usize::try_from(len)
        .map_err(|_| CodecError::Malformed(format!("byte array length {len} too large")))?;
    if src.len() - header < len {
        return Err(CodecError::Incomplete);
    }
    src.advance(header);
    Ok(src.split_to(len))
}

pub fn get_string(src: &mut Bytes) -> Result<String, CodecError> {
    let raw = get_bytes(src)?;
    String::from_utf8(raw.to_vec())
        .map_err(|e| CodecError::Malformed(format!("string is not UTF-8: {e}")))
}

// ─── Bulk codec ─────────────────────────────────────────────────────

/// Primitive kinds a packet schema is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    VarInt,
    Byte,
    Boolean,
    String,
    ByteArray,
    /// Length-prefixed list of `string -> bytes` entries.
    Map,
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    VarInt(u64),
    Byte(i8),
    Boolean(bool),
    String(String),
    ByteArray(Bytes),
    Map(BTreeMap<String, Bytes>),
}

impl Field {
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::VarInt(_) => FieldKind::VarInt,
            Field::Byte(_) => FieldKind::Byte,
            Field::Boolean(_) => FieldKind::Boolean,
            Field::String(_) => FieldKind::String,
            Field::ByteArray(_) => FieldKind::ByteArray,
            Field::Map(_) => FieldKind::Map,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Field::VarInt(value) => encode_varint(*value, buf),
            Field::Byte(value) => buf.put_i8(*value),
            Field::Boolean(value) => buf.put_u8(u8::from(*value)),
            Field::String(value) => put_string(value, buf),
            Field::ByteArray(value) => put_bytes(value, buf),
            Field::Map(entries) => {
                encode_varint(entries.len() as u64, buf);
                for (key, value) in entries {
                    put_string(key, buf);
                    put_bytes(value, buf);
                }
            }
        }
    }

    fn decode(kind: FieldKind, src: &mut Bytes) -> Result<Self, CodecError> {
        Ok(match kind {
            FieldKind::VarInt => Field::VarInt(get_varint(src)?),
            FieldKind::Byte => {
                if src.is_empty() {
                    return Err(CodecError::Incomplete);
                }
                Field::Byte(src.get_i8())
            }
            FieldKind::Boolean => {
                if src.is_empty() {
                    return Err(CodecError::Incomplete);
                }
                match src.get_u8() {
                    0 => Field::Boolean(false),
                    1 => Field::Boolean(true),
                    other => {
                        return Err(CodecError::Malformed(format!(
                            "boolean byte must be 0 or 1, got {other}"
                        )))
                    }
                }
            }
            FieldKind::String => Field::String(get_string(src)?),
            FieldKind::ByteArray => Field::ByteArray(get_bytes(src)?),
            FieldKind::Map => {
                let count = get_varint(src)?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = get_string(src)?;
                    let value = get_bytes(src)?;
                    entries.insert(key, value);
                }
                Field::Map(entries)
            }
        })
    }
}

/// Serialize `fields` in order.
pub fn encode_fields(fields: &[Field], buf: &mut BytesMut) {
    for field in fields {
        field.encode(buf);
    }
}

/// Parse one field per entry of `schema` from the front of `src`.
///
/// A buffer that ends early is malformed: callers only hand complete frame
/// payloads to the bulk codec.
pub fn decode_fields(src: &mut Bytes, schema: &[FieldKind]) -> Result<Vec<Field>, CodecError> {
    schema
        .iter()
        .enumerate()
        .map(|(index, &kind)| {
            Field::decode(kind, src).map_err(|e| match e {
                CodecError::Incomplete => {
                    CodecError::Malformed(format!("truncated at field {index} ({kind:?})"))
                }
                malformed @ CodecError::Malformed(_) => malformed,
            })
        })
        .collect()
}

// ─── Frames ─────────────────────────────────────────────────────────

/// One wire-level unit: a channel id and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel_id,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        encode_frame(self.channel_id, &self.payload)
    }

    /// Parse a complete frame body (`varint(channelId) payload`).
    pub fn from_body(mut body: Bytes) -> Result<Self, CodecError> {
        if body.is_empty() {
            return Err(CodecError::Malformed("empty frame body".into()));
        }
        let channel_id = match get_varint(&mut body) {
            Ok(id) => u32::try_from(id)
                .map_err(|_| CodecError::Malformed(format!("channel id {id} out of range")))?,
            Err(CodecError::Incomplete) => {
                return Err(CodecError::Malformed("channel id runs past frame end".into()))
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            channel_id,
            payload: body,
        })
    }
}

/// Encode `varint(len) varint(channel_id) payload` in one buffer.
pub fn encode_frame(channel_id: u32, payload: &[u8]) -> Bytes {
    let body_len = varint_len(u64::from(channel_id)) + payload.len();
    let mut buf = BytesMut::with_capacity(varint_len(body_len as u64) + body_len);
    encode_varint(body_len as u64, &mut buf);
    encode_varint(u64::from(channel_id), &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}
