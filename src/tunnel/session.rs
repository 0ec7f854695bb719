//! Tunnel session: one physical socket, one handshake lifetime.
//!
//! States move `Handshaking -> Ready -> Ended`:
//!
//! 1. The agent sends `Identify` and waits for `IdentifySuccess`. The gateway
//!    waits for `Identify`, checks the protocol version and answers with
//!    `IdentifySuccess` or `IdentifyFailure`. A handshake that fails or runs
//!    past the timeout closes the socket and no session handle is returned.
//! 2. Once ready, a single reader task decodes frames in arrival order and
//!    dispatches them, and a single writer task owns the sink, so frames
//!    queued by concurrent virtual connections never interleave.
//! 3. When the socket goes away every open channel is torn down without
//!    sending `ConnectionEnd`, the channel table and free pool are cleared,
//!    and [`SessionEvent::Ended`] fires once.
//!
//! Lifecycle notifications go out on the [`SessionEvents`] queue returned by
//! [`TunnelSession::accept`] / [`TunnelSession::initiate`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::allocator::ChannelAllocator;
use super::codec::{self, Frame};
use super::connection::VirtualConnection;
use super::packet::{ControlPacket, Direction, IdentifyFailureReason, Phase};
use super::reassembler::FrameReassembler;
use super::transport::{FrameSink, FrameStream, TransportError};
use super::{TunnelError, CONTROL_CHANNEL, DEFAULT_BRANDING, MAX_FRAME_PAYLOAD, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Public side: accepts the tunnel and opens channels.
    Gateway,
    /// Private side: dials the gateway and serves the channels it opens.
    Agent,
}

impl Role {
    /// Direction of packets this side receives.
    pub fn inbound(self) -> Direction {
        match self {
            Role::Gateway => Direction::ToGateway,
            Role::Agent => Direction::ToAgent,
        }
    }

    /// Direction of packets this side sends.
    pub fn outbound(self) -> Direction {
        match self {
            Role::Gateway => Direction::ToAgent,
            Role::Agent => Direction::ToGateway,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    Ended,
}

/// Handshake parameters and per-session buffer sizes.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub branding: String,
    /// Public URL announced in `IdentifySuccess` (gateway only).
    pub url: String,
    pub timeout: Duration,
    /// Inbound chunks buffered per channel before the dispatcher waits.
    pub channel_buffer: usize,
    /// Outbound frames queued before writers wait on the socket.
    pub write_queue: usize,
    /// How long the dispatcher waits on a full channel queue before closing
    /// that channel.
    pub stall_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            branding: DEFAULT_BRANDING.to_string(),
            url: String::new(),
            timeout: Duration::from_secs(30),
            channel_buffer: 64,
            write_queue: 256,
            stall_timeout: Duration::from_secs(10),
        }
    }
}

/// What the other side announced during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub branding: String,
    pub protocol_version: u32,
    /// Public URL of the gateway; empty when the peer is an agent.
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed on this side; `ConnectionEnd` was sent.
    Local,
    /// The peer sent `ConnectionEnd`.
    Remote,
    /// The physical socket went away.
    SessionEnded,
}

#[derive(Debug)]
pub enum SessionEvent {
    Ready,
    Ended {
        reason: String,
    },
    ConnectionOpened {
        channel_id: u32,
    },
    ConnectionClosed {
        channel_id: u32,
        cause: CloseCause,
    },
    /// The gateway opened a channel; the agent should dial its local service.
    NewConnectionRequested {
        channel_id: u32,
        ip: String,
        port: u16,
        connection: VirtualConnection,
    },
    /// The agent reached its local service for this channel.
    ConnectionAcknowledged {
        channel_id: u32,
    },
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct ChannelEntry {
    /// Distinguishes reuses of the same channel id.
    generation: u64,
    inbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

struct ChannelTable {
    state: SessionState,
    channels: HashMap<u32, ChannelEntry>,
    allocator: ChannelAllocator,
    /// Ids the gateway closed that the agent has not confirmed yet.
    awaiting_ack: HashSet<u32>,
}

struct SessionInner {
    role: Role,
    config: HandshakeConfig,
    peer: OnceLock<PeerIdentity>,
    table: Mutex<ChannelTable>,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
    ended: AtomicBool,
    next_generation: AtomicU64,
}

/// Shared handle to a tunnel session. Clones refer to the same session.
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("channels", &self.channel_count())
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    /// Gateway side: wait for the agent's `Identify` and answer it.
    pub async fn accept<S, R>(
        sink: S,
        stream: R,
        config: HandshakeConfig,
    ) -> Result<(Self, SessionEvents), TunnelError>
    where
        S: FrameSink,
        R: FrameStream,
    {
        Self::establish(Role::Gateway, sink, stream, config).await
    }

    /// Agent side: send `Identify` and wait for the gateway's verdict.
    pub async fn initiate<S, R>(
        sink: S,
        stream: R,
        config: HandshakeConfig,
    ) -> Result<(Self, SessionEvents), TunnelError>
    where
        S: FrameSink,
        R: FrameStream,
    {
        Self::establish(Role::Agent, sink, stream, config).await
    }

    async fn establish<S, R>(
        role: Role,
        mut sink: S,
        mut stream: R,
        config: HandshakeConfig,
    ) -> Result<(Self, SessionEvents), TunnelError>
    where
        S: FrameSink,
        R: FrameStream,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timeout = config.timeout;
        let session = Self {
            inner: Arc::new(SessionInner {
                role,
                config,
                peer: OnceLock::new(),
                table: Mutex::new(ChannelTable {
                    state: SessionState::Handshaking,
                    channels: HashMap::new(),
                    allocator: ChannelAllocator::new(),
                    awaiting_ack: HashSet::new(),
                }),
                outbound: outbound_tx,
                events: events_tx,
                shutdown: CancellationToken::new(),
                ended: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
            }),
        };

        let mut reassembler = FrameReassembler::new();
        let outcome = tokio::time::timeout(
            timeout,
            session.handshake(&mut sink, &mut stream, &mut reassembler),
        )
        .await
        .unwrap_or(Err(TunnelError::HandshakeTimeout(timeout)));

        if let Err(e) = outcome {
            session.table().state = SessionState::Ended;
            session.inner.ended.store(true, Ordering::Release);
            session.inner.shutdown.cancel();
            let _ = sink.close().await;
            return Err(e);
        }

        session.table().state = SessionState::Ready;
        session.emit(SessionEvent::Ready);

        let span = info_span!("tunnel_session", role = ?role);
        tokio::spawn(write_loop(session.clone(), sink, outbound_rx).instrument(span.clone()));
        tokio::spawn(read_loop(session.clone(), stream, reassembler).instrument(span));
        Ok((session, events_rx))
    }

    async fn handshake<S, R>(
        &self,
        sink: &mut S,
        stream: &mut R,
        reassembler: &mut FrameReassembler,
    ) -> Result<(), TunnelError>
    where
        S: FrameSink,
        R: FrameStream,
    {
        let config = &self.inner.config;
        let peer = match self.inner.role {
            Role::Agent => {
                let identify = ControlPacket::Identify {
                    protocol_version: config.protocol_version,
                    branding: config.branding.clone(),
                };
                sink.send(identify.to_frame(Direction::ToGateway)?).await?;

                match next_handshake_packet(stream, reassembler, Direction::ToAgent).await? {
                    ControlPacket::IdentifySuccess {
                        branding,
                        protocol_version,
                        url,
                    } => {
                        if protocol_version != config.protocol_version {
                            return Err(TunnelError::ProtocolVersionMismatch {
                                expected: config.protocol_version,
                                actual: protocol_version,
                            });
                        }
                        PeerIdentity {
                            branding,
                            protocol_version,
                            url,
                        }
                    }
                    ControlPacket::IdentifyFailure { reason } => {
                        return Err(TunnelError::IdentifyRejected(reason))
                    }
                    other => {
                        return Err(TunnelError::UnexpectedPacket(format!(
                            "{other:?} during handshake"
                        )))
                    }
                }
            }
            Role::Gateway => {
                match next_handshake_packet(stream, reassembler, Direction::ToGateway).await? {
                    ControlPacket::Identify {
                        protocol_version,
                        branding,
                    } => {
                        if protocol_version != config.protocol_version {
                            warn!(
                                expected = config.protocol_version,
                                actual = protocol_version,
                                "Rejecting agent with wrong protocol version"
                            );
                            let failure = ControlPacket::IdentifyFailure {
                                reason: IdentifyFailureReason::BadVersion,
                            };
                            sink.send(failure.to_frame(Direction::ToAgent)?).await?;
                            return Err(TunnelError::ProtocolVersionMismatch {
                                expected: config.protocol_version,
                                actual: protocol_version,
                            });
                        }
                        let success = ControlPacket::IdentifySuccess {
                            branding: config.branding.clone(),
                            protocol_version,
                            url: config.url.clone(),
                        };
                        sink.send(success.to_frame(Direction::ToAgent)?).await?;
                        PeerIdentity {
                            branding,
                            protocol_version,
                            url: String::new(),
                        }
                    }
                    other => {
                        return Err(TunnelError::UnexpectedPacket(format!(
                            "{other:?} during handshake"
                        )))
                    }
                }
            }
        };

        debug!(
            branding = %peer.branding,
            protocol_version = peer.protocol_version,
            "Handshake complete"
        );
        let _ = self.inner.peer.set(peer);
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Set once the handshake succeeded.
    pub fn peer(&self) -> Option<&PeerIdentity> {
        self.inner.peer.get()
    }

    pub fn state(&self) -> SessionState {
        self.table().state
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    pub fn channel_count(&self) -> usize {
        self.table().channels.len()
    }

    /// Channels closed by the gateway whose id is not reusable yet.
    pub fn awaiting_ack_count(&self) -> usize {
        self.table().awaiting_ack.len()
    }

    pub fn same_session(&self, other: &TunnelSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the session has ended.
    pub async fn ended(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Tear the session down from this side.
    pub fn close(&self) {
        self.end("closed locally");
    }

    // ─── Channels ───────────────────────────────────────────────────

    /// Allocate a channel, announce it with `NewConnection` and return its
    /// virtual connection. Gateway only.
    pub async fn open_channel(&self, ip: &str, port: u16) -> Result<VirtualConnection, TunnelError> {
        if self.inner.role != Role::Gateway {
            return Err(TunnelError::UnexpectedPacket(
                "only the gateway opens channels".into(),
            ));
        }
        let connection = {
            let mut table = self.table();
            if table.state != SessionState::Ready {
                return Err(TunnelError::SessionEnded);
            }
            let channel_id = table
                .allocator
                .allocate()
                .ok_or(TunnelError::ChannelsExhausted)?;
            self.insert_channel(&mut table, channel_id)
        };
        let channel_id = connection.channel_id();
        self.emit(SessionEvent::ConnectionOpened { channel_id });

        self.send_control_packet(&ControlPacket::NewConnection {
            ip: ip.to_string(),
            port,
            channel_id,
        })
        .await?;
        debug!(channel_id, %ip, port, "Opened channel");
        Ok(connection)
    }

    fn insert_channel(&self, table: &mut ChannelTable, channel_id: u32) -> VirtualConnection {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.inner.config.channel_buffer.max(1));
        let closed = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        table.channels.insert(
            channel_id,
            ChannelEntry {
                generation,
                inbound: inbound_tx,
                closed: closed.clone(),
            },
        );
        VirtualConnection::new(self.clone(), channel_id, generation, inbound_rx, closed)
    }

    /// Register a channel the gateway opened. A live channel with the same id
    /// is dropped first: the gateway owns id assignment.
    fn accept_channel(&self, channel_id: u32) -> Option<VirtualConnection> {
        let (connection, replaced) = {
            let mut table = self.table();
            if table.state != SessionState::Ready {
                return None;
            }
            let replaced = table.channels.remove(&channel_id);
            if let Some(entry) = &replaced {
                entry.closed.cancel();
            }
            (self.insert_channel(&mut table, channel_id), replaced.is_some())
        };
        if replaced {
            warn!(channel_id, "Gateway reopened a live channel, dropping the old one");
            self.emit(SessionEvent::ConnectionClosed {
                channel_id,
                cause: CloseCause::Remote,
            });
        }
        Some(connection)
    }

    /// Close `channel_id` from this side. No-op if that generation of the
    /// channel is already gone or the session has ended.
    pub(crate) fn close_channel(&self, channel_id: u32, generation: u64) {
        {
            let mut table = self.table();
            if table.state != SessionState::Ready {
                return;
            }
            match table.channels.get(&channel_id) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            if let Some(entry) = table.channels.remove(&channel_id) {
                entry.closed.cancel();
            }
            if self.inner.role == Role::Gateway {
                table.awaiting_ack.insert(channel_id);
            }
        }
        debug!(channel_id, "Channel closed locally");
        self.emit(SessionEvent::ConnectionClosed {
            channel_id,
            cause: CloseCause::Local,
        });
        let end = ControlPacket::ConnectionEnd { channel_id };
        if let Ok(frame) = end.to_frame(self.inner.role.outbound()) {
            self.enqueue_detached(frame);
        }
    }

    // ─── Writes ─────────────────────────────────────────────────────

    pub async fn send_control_packet(&self, packet: &ControlPacket) -> Result<(), TunnelError> {
        let frame = packet.to_frame(self.inner.role.outbound())?;
        self.enqueue(frame).await
    }

    /// Frame `data` onto an open channel, splitting it into frames of at most
    /// [`MAX_FRAME_PAYLOAD`] bytes.
    pub async fn send_channel_data(&self, channel_id: u32, data: &[u8]) -> Result<(), TunnelError> {
        if channel_id == CONTROL_CHANNEL {
            return Err(TunnelError::UnexpectedPacket(
                "raw data on the control channel".into(),
            ));
        }
        if self.is_ended() {
            return Err(TunnelError::SessionEnded);
        }
        let generation = self
            .table()
            .channels
            .get(&channel_id)
            .map(|entry| entry.generation)
            .ok_or(TunnelError::UnknownChannel(channel_id))?;
        self.send_on_channel(channel_id, generation, data).await
    }

    /// Queue `data` for one generation of a channel.
    ///
    /// Each chunk is queued under the table lock only while that generation is
    /// still live, so a write that outlives its channel can never land on a
    /// channel that reused the id.
    pub(crate) async fn send_on_channel(
        &self,
        channel_id: u32,
        generation: u64,
        data: &[u8],
    ) -> Result<(), TunnelError> {
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let permit = tokio::select! {
                permit = self.inner.outbound.reserve() => {
                    permit.map_err(|_| TunnelError::SessionEnded)?
                }
                () = self.inner.shutdown.cancelled() => return Err(TunnelError::SessionEnded),
            };
            let frame = codec::encode_frame(channel_id, chunk);
            self.with_live_channel(channel_id, generation, move || permit.send(frame))
                .ok_or(TunnelError::ChannelClosed(channel_id))?;
        }
        Ok(())
    }

    /// Run `f` with the table locked if `generation` of `channel_id` is open.
    pub(crate) fn with_live_channel<R>(
        &self,
        channel_id: u32,
        generation: u64,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let table = self.table();
        let live = table.state == SessionState::Ready
            && table
                .channels
                .get(&channel_id)
                .is_some_and(|entry| entry.generation == generation);
        live.then(f)
    }

    pub(crate) fn outbound(&self) -> mpsc::Sender<Bytes> {
        self.inner.outbound.clone()
    }

    async fn enqueue(&self, frame: Bytes) -> Result<(), TunnelError> {
        tokio::select! {
            sent = self.inner.outbound.send(frame) => sent.map_err(|_| TunnelError::SessionEnded),
            () = self.inner.shutdown.cancelled() => Err(TunnelError::SessionEnded),
        }
    }

    /// Queue a frame without waiting. Used from synchronous close paths.
    fn enqueue_detached(&self, frame: Bytes) {
        match self.inner.outbound.try_send(frame) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let outbound = self.inner.outbound.clone();
                let shutdown = self.inner.shutdown.clone();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = outbound.send(frame) => {}
                        () = shutdown.cancelled() => {}
                    }
                });
            }
        }
    }

    // ─── Dispatch ───────────────────────────────────────────────────

    async fn dispatch_buffered(&self, reassembler: &mut FrameReassembler) -> Result<(), TunnelError> {
        while let Some(frame) = reassembler.next_frame()? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), TunnelError> {
        if frame.channel_id != CONTROL_CHANNEL {
            self.deliver(frame).await;
            return Ok(());
        }
        match ControlPacket::decode(Phase::Ready, self.inner.role.inbound(), frame.payload) {
            Ok(packet) => self.handle_control(packet).await,
            Err(TunnelError::UnknownPacket(id)) => {
                warn!(packet_id = id, "Ignoring unknown control packet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Push a data frame to its channel. A reader that leaves its queue full
    /// for longer than `stall_timeout` gets its channel closed, so one stuck
    /// channel cannot hold up the dispatcher for the others.
    async fn deliver(&self, frame: Frame) {
        let channel_id = frame.channel_id;
        let target = self
            .table()
            .channels
            .get(&channel_id)
            .map(|entry| (entry.generation, entry.inbound.clone(), entry.closed.clone()));
        let Some((generation, inbound, closed)) = target else {
            trace!(
                channel_id,
                len = frame.payload.len(),
                "Dropping frame for unknown channel"
            );
            return;
        };
        let payload = match inbound.try_send(frame.payload) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(payload)) => payload,
        };

        let stall_timeout = self.inner.config.stall_timeout;
        tokio::select! {
            sent = tokio::time::timeout(stall_timeout, inbound.send(payload)) => {
                if sent.is_err() {
                    warn!(
                        channel_id,
                        timeout_ms = stall_timeout.as_millis(),
                        "Channel reader stalled, closing channel"
                    );
                    self.close_channel(channel_id, generation);
                }
            }
            () = closed.cancelled() => {}
        }
    }

    async fn handle_control(&self, packet: ControlPacket) -> Result<(), TunnelError> {
        match packet {
            ControlPacket::NewConnection {
                ip,
                port,
                channel_id,
            } => {
                if channel_id == CONTROL_CHANNEL {
                    return Err(TunnelError::MalformedFrame(
                        "NewConnection for the control channel".into(),
                    ));
                }
                if let Some(connection) = self.accept_channel(channel_id) {
                    debug!(channel_id, %ip, port, "Gateway opened channel");
                    self.emit(SessionEvent::ConnectionOpened { channel_id });
                    self.emit(SessionEvent::NewConnectionRequested {
                        channel_id,
                        ip,
                        port,
                        connection,
                    });
                }
            }
            ControlPacket::ConnectionEnd { channel_id } => self.remote_end(channel_id).await,
            ControlPacket::AckConnectionOpen { channel_id } => {
                debug!(channel_id, "Agent reached local service");
                self.emit(SessionEvent::ConnectionAcknowledged { channel_id });
            }
            ControlPacket::AckConnectionClose { channel_id } => self.release_acknowledged(channel_id),
            other => warn!(packet = ?other, "Ignoring handshake packet on a ready session"),
        }
        Ok(())
    }

    async fn remote_end(&self, channel_id: u32) {
        let was_open = {
            let mut table = self.table();
            if let Some(entry) = table.channels.remove(&channel_id) {
                entry.closed.cancel();
                if self.inner.role == Role::Gateway {
                    table.allocator.release(channel_id);
                }
                true
            } else {
                if table.awaiting_ack.remove(&channel_id) {
                    table.allocator.release(channel_id);
                }
                false
            }
        };
        if !was_open {
            trace!(channel_id, "ConnectionEnd for a channel that is already closed");
            return;
        }

        debug!(channel_id, "Channel closed by peer");
        self.emit(SessionEvent::ConnectionClosed {
            channel_id,
            cause: CloseCause::Remote,
        });
        if self.inner.role == Role::Agent {
            if let Err(e) = self
                .send_control_packet(&ControlPacket::AckConnectionClose { channel_id })
                .await
            {
                debug!(channel_id, error = %e, "Could not acknowledge channel close");
            }
        }
    }

    fn release_acknowledged(&self, channel_id: u32) {
        let mut table = self.table();
        if table.awaiting_ack.remove(&channel_id) {
            table.allocator.release(channel_id);
            trace!(channel_id, "Channel id released");
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// End the session. Runs once; later calls are no-ops.
    pub(crate) fn end(&self, reason: &str) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut drained: Vec<(u32, ChannelEntry)> = {
            let mut table = self.table();
            table.state = SessionState::Ended;
            table.allocator.reset();
            table.awaiting_ack.clear();
            table.channels.drain().collect()
        };
        drained.sort_unstable_by_key(|(channel_id, _)| *channel_id);

        for (channel_id, entry) in drained {
            entry.closed.cancel();
            self.emit(SessionEvent::ConnectionClosed {
                channel_id,
                cause: CloseCause::SessionEnded,
            });
        }
        self.inner.shutdown.cancel();
        info!(%reason, "Tunnel session ended");
        self.emit(SessionEvent::Ended {
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // Never called with the table locked: a dropped event may carry a
        // VirtualConnection whose Drop closes its channel.
        let _ = self.inner.events.send(event);
    }

    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn next_handshake_packet<R: FrameStream>(
    stream: &mut R,
    reassembler: &mut FrameReassembler,
    direction: Direction,
) -> Result<ControlPacket, TunnelError> {
    loop {
        while let Some(frame) = reassembler.next_frame()? {
            if frame.channel_id == CONTROL_CHANNEL {
                return ControlPacket::decode(Phase::Handshake, direction, frame.payload);
            }
            trace!(
                channel_id = frame.channel_id,
                "Dropping data frame received before the handshake finished"
            );
        }
        match stream.next().await {
            Some(Ok(message)) => reassembler.push(&message),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed.into()),
        }
    }
}

async fn write_loop<S: FrameSink>(
    session: TunnelSession,
    mut sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
) {
    let shutdown = session.inner.shutdown.clone();
    loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let sent = tokio::select! {
            sent = sink.send(frame) => sent,
            () = shutdown.cancelled() => break,
        };
        if let Err(e) = sent {
            session.end(&format!("write failed: {e}"));
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R: FrameStream>(
    session: TunnelSession,
    mut stream: R,
    mut reassembler: FrameReassembler,
) {
    let shutdown = session.inner.shutdown.clone();
    let reason = loop {
        // Frames that arrived together with the handshake come first.
        if let Err(e) = session.dispatch_buffered(&mut reassembler).await {
            warn!(error = %e, "Protocol error on tunnel socket");
            break e.to_string();
        }
        let message = tokio::select! {
            () = shutdown.cancelled() => return,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(message)) => reassembler.push(&message),
            Some(Err(e)) => break format!("transport error: {e}"),
            None => break "socket closed by peer".to_string(),
        }
    };
    session.end(&reason);
}
