//! Virtual connection: one channel seen as a byte stream.
//!
//! Writes are framed onto the channel and queued on the session's writer.
//! Inbound payloads are pushed by the session dispatcher into a bounded queue
//! in dispatch order; once the channel is closed the queue drains and then
//! reads return end-of-stream.
//!
//! [`VirtualConnection`] also implements tokio's `AsyncRead`/`AsyncWrite`, so it
//! can be handed to `copy_bidirectional`, hyper or tokio-tungstenite as if it
//! were a socket. Dropping it closes the channel.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use super::codec;
use super::session::TunnelSession;
use super::{TunnelError, MAX_FRAME_PAYLOAD};

pub struct VirtualConnection {
    session: TunnelSession,
    channel_id: u32,
    generation: u64,
    inbound: mpsc::Receiver<Bytes>,
    /// Unread remainder of the last inbound chunk.
    pending: Bytes,
    writer: PollSender<Bytes>,
    closed: CancellationToken,
}

impl VirtualConnection {
    pub(crate) fn new(
        session: TunnelSession,
        channel_id: u32,
        generation: u64,
        inbound: mpsc::Receiver<Bytes>,
        closed: CancellationToken,
    ) -> Self {
        let writer = PollSender::new(session.outbound());
        Self {
            session,
            channel_id,
            generation,
            inbound,
            pending: Bytes::new(),
            writer,
            closed,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel is closed, from either side or by session end.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Send `data` on this channel.
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ChannelClosed(self.channel_id));
        }
        match self
            .session
            .send_on_channel(self.channel_id, self.generation, data)
            .await
        {
            Err(TunnelError::SessionEnded) => Err(TunnelError::ChannelClosed(self.channel_id)),
            other => other,
        }
    }

    /// Next inbound chunk, `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        self.inbound.recv().await
    }

    /// Close the channel and tell the peer. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.session.close_channel(self.channel_id, self.generation);
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("channel_id", &self.channel_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error(channel_id: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        TunnelError::ChannelClosed(channel_id),
    )
}

impl AsyncRead for VirtualConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(chunk) => this.pending = chunk,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed.is_cancelled() {
            return Poll::Ready(Err(closed_error(this.channel_id)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed_error(this.channel_id)));
        }
        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let (channel_id, generation) = (this.channel_id, this.generation);
        let frame = codec::encode_frame(channel_id, &buf[..n]);
        let writer = &mut this.writer;
        // The channel may have closed, and its id been reused, while waiting
        // for queue space.
        match this
            .session
            .with_live_channel(channel_id, generation, || writer.send_item(frame))
        {
            Some(Ok(())) => Poll::Ready(Ok(n)),
            Some(Err(_)) => Poll::Ready(Err(closed_error(channel_id))),
            None => {
                this.writer.abort_send();
                Poll::Ready(Err(closed_error(channel_id)))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}
