//! Rebuilds frame boundaries from transport messages.
//!
//! A transport message may hold zero, one or many frames, and a frame (its
//! length header included) may straddle several messages. The reassembler
//! keeps an accumulation buffer plus the length of the frame currently being
//! waited on, and hands out complete frames in arrival order.
//!
//! It is stateful and belongs to exactly one session.

use bytes::{Buf, BytesMut};

use super::codec::{self, CodecError, Frame};
use super::TunnelError;

/// Largest frame body accepted from a peer (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameReassembler {
    buf: BytesMut,
    /// Body length of the frame whose header has been consumed.
    pending_len: Option<usize>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one transport message.
    pub fn push(&mut self, message: &[u8]) {
        self.buf.extend_from_slice(message);
    }

    /// Append `message` and iterate over every frame that is now complete.
    pub fn feed(&mut self, message: &[u8]) -> Frames<'_> {
        self.push(message);
        Frames {
            reassembler: self,
            failed: false,
        }
    }

    /// Next complete frame, `Ok(None)` when more bytes are needed.
    ///
    /// Any error is fatal: the byte stream can no longer be resynchronised.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => match codec::decode_varint(&self.buf) {
                Ok((len, header)) => {
                    let len = usize::try_from(len)
                        .ok()
                        .filter(|len| *len <= MAX_FRAME_LEN)
                        .ok_or_else(|| {
                            TunnelError::MalformedFrame(format!(
                                "frame length {len} exceeds {MAX_FRAME_LEN}"
                            ))
                        })?;
                    self.buf.advance(header);
                    self.pending_len = Some(len);
                    len
                }
                Err(CodecError::Incomplete) => return Ok(None),
                Err(CodecError::Malformed(reason)) => {
                    return Err(TunnelError::MalformedFrame(format!("frame length: {reason}")))
                }
            },
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        let body = self.buf.split_to(len).freeze();
        self.pending_len = None;
        Frame::from_body(body)
            .map(Some)
            .map_err(|e| TunnelError::MalformedFrame(format!("frame header: {e}")))
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Iterator returned by [`FrameReassembler::feed`]. Stops after the first error.
pub struct Frames<'a> {
    reassembler: &'a mut FrameReassembler,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, TunnelError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reassembler.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
