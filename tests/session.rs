//! Session behaviour over an in-memory transport.
//!
//! Either both ends are real sessions, or one end is a scripted peer that
//! writes raw frames, so malformed and out-of-order traffic can be injected.

use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use forwarder::tunnel::codec::encode_frame;
use forwarder::tunnel::{
    CloseCause, ControlPacket, Direction, Frame, FrameReassembler, FrameSink, FrameStream,
    HandshakeConfig, IdentifyFailureReason, Phase, SessionEvent, SessionEvents, SessionState,
    TransportError, TunnelError, TunnelSession, CONTROL_CHANNEL,
};

const WAIT: Duration = Duration::from_secs(5);

/// One direction of the in-memory socket, seen from the writing side.
fn pipe() -> (impl FrameSink, impl FrameStream) {
    let (tx, rx) = mpsc::unbounded::<Bytes>();
    (
        tx.sink_map_err(|_| TransportError::Closed),
        rx.map(Ok::<Bytes, TransportError>),
    )
}

fn config(version: u32) -> HandshakeConfig {
    HandshakeConfig {
        protocol_version: version,
        branding: "test".into(),
        url: "http://gateway.test/".into(),
        timeout: WAIT,
        ..HandshakeConfig::default()
    }
}

struct Pair {
    gateway: TunnelSession,
    gateway_events: SessionEvents,
    agent: TunnelSession,
    agent_events: SessionEvents,
}

async fn connected_pair() -> Pair {
    let (agent_sink, gateway_stream) = pipe();
    let (gateway_sink, agent_stream) = pipe();
    let (gateway, agent) = tokio::join!(
        TunnelSession::accept(gateway_sink, gateway_stream, config(7)),
        TunnelSession::initiate(agent_sink, agent_stream, config(7)),
    );
    let (gateway, gateway_events) = gateway.unwrap();
    let (agent, agent_events) = agent.unwrap();
    Pair {
        gateway,
        gateway_events,
        agent,
        agent_events,
    }
}

/// Scripted gateway: raw frames in and out.
struct RawGateway {
    tx: UnboundedSender<Bytes>,
    rx: UnboundedReceiver<Bytes>,
    reassembler: FrameReassembler,
}

impl RawGateway {
    async fn send_raw(&mut self, bytes: impl Into<Bytes>) {
        self.tx.send(bytes.into()).await.unwrap();
    }

    async fn send_packet(&mut self, packet: ControlPacket) {
        let frame = packet.to_frame(Direction::ToAgent).unwrap();
        self.send_raw(frame).await;
    }

    async fn next_packet(&mut self, phase: Phase) -> ControlPacket {
        loop {
            if let Some(frame) = self.reassembler.next_frame().unwrap() {
                assert_eq!(frame.channel_id, CONTROL_CHANNEL);
                return ControlPacket::decode(phase, Direction::ToGateway, frame.payload).unwrap();
            }
            let message = tokio::time::timeout(WAIT, self.rx.next())
                .await
                .unwrap()
                .unwrap();
            self.reassembler.push(&message);
        }
    }
}

/// A real agent session handshaken against a scripted gateway.
async fn agent_with_raw_gateway() -> (TunnelSession, SessionEvents, RawGateway) {
    agent_with_raw_gateway_using(config(7)).await
}

async fn agent_with_raw_gateway_using(
    config: HandshakeConfig,
) -> (TunnelSession, SessionEvents, RawGateway) {
    let (to_agent_tx, to_agent_rx) = mpsc::unbounded::<Bytes>();
    let (to_gateway_tx, to_gateway_rx) = mpsc::unbounded::<Bytes>();
    let mut raw = RawGateway {
        tx: to_agent_tx,
        rx: to_gateway_rx,
        reassembler: FrameReassembler::new(),
    };

    let agent = tokio::spawn(TunnelSession::initiate(
        to_gateway_tx.sink_map_err(|_| TransportError::Closed),
        to_agent_rx.map(Ok::<Bytes, TransportError>),
        config,
    ));
    match raw.next_packet(Phase::Handshake).await {
        ControlPacket::Identify {
            protocol_version, ..
        } => assert_eq!(protocol_version, 7),
        other => panic!("expected Identify, got {other:?}"),
    }
    raw.send_packet(ControlPacket::IdentifySuccess {
        branding: "raw".into(),
        protocol_version: 7,
        url: "http://raw.test/".into(),
    })
    .await;
    let (agent, events) = agent.await.unwrap().unwrap();
    (agent, events, raw)
}

/// Scripted agent facing a real gateway. The gateway writes into a
/// rendezvous channel, so its writer stalls until the agent reads.
struct RawAgent {
    tx: UnboundedSender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    reassembler: FrameReassembler,
}

impl RawAgent {
    async fn send_packet(&mut self, packet: ControlPacket) {
        let frame = packet.to_frame(Direction::ToGateway).unwrap();
        self.tx.send(frame).await.unwrap();
    }

    /// Next frame from the gateway, `None` if nothing arrives within `wait`.
    async fn next_frame_within(&mut self, wait: Duration) -> Option<Frame> {
        loop {
            if let Some(frame) = self.reassembler.next_frame().unwrap() {
                return Some(frame);
            }
            let message = tokio::time::timeout(wait, self.rx.next()).await.ok()??;
            self.reassembler.push(&message);
        }
    }

    async fn next_packet(&mut self, phase: Phase) -> ControlPacket {
        let frame = self.next_frame_within(WAIT).await.expect("no frame from gateway");
        assert_eq!(frame.channel_id, CONTROL_CHANNEL);
        ControlPacket::decode(phase, Direction::ToAgent, frame.payload).unwrap()
    }
}

/// A real gateway session with a one-frame write queue, handshaken against a
/// scripted agent.
async fn gateway_with_raw_agent() -> (TunnelSession, SessionEvents, RawAgent) {
    let (to_gateway_tx, to_gateway_rx) = mpsc::unbounded::<Bytes>();
    let (to_agent_tx, to_agent_rx) = mpsc::channel::<Bytes>(0);
    let mut raw = RawAgent {
        tx: to_gateway_tx,
        rx: to_agent_rx,
        reassembler: FrameReassembler::new(),
    };

    let gateway = tokio::spawn(TunnelSession::accept(
        to_agent_tx.sink_map_err(|_| TransportError::Closed),
        to_gateway_rx.map(Ok::<Bytes, TransportError>),
        HandshakeConfig {
            write_queue: 1,
            ..config(7)
        },
    ));
    raw.send_packet(ControlPacket::Identify {
        protocol_version: 7,
        branding: "raw".into(),
    })
    .await;
    assert!(matches!(
        raw.next_packet(Phase::Handshake).await,
        ControlPacket::IdentifySuccess { .. }
    ));
    let (gateway, events) = gateway.await.unwrap().unwrap();
    (gateway, events, raw)
}

async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event queue closed")
}

async fn next_new_connection(events: &mut SessionEvents) -> (u32, String, u16, forwarder::VirtualConnection) {
    loop {
        if let SessionEvent::NewConnectionRequested {
            channel_id,
            ip,
            port,
            connection,
        } = next_event(events).await
        {
            return (channel_id, ip, port, connection);
        }
    }
}

#[tokio::test]
async fn handshake_reports_peer_identity() {
    let mut pair = connected_pair().await;
    assert_eq!(pair.gateway.state(), SessionState::Ready);
    assert_eq!(pair.agent.state(), SessionState::Ready);

    let gateway_view = pair.gateway.peer().unwrap();
    assert_eq!(gateway_view.branding, "test");
    assert_eq!(gateway_view.protocol_version, 7);
    let agent_view = pair.agent.peer().unwrap();
    assert_eq!(agent_view.url, "http://gateway.test/");

    assert!(matches!(next_event(&mut pair.gateway_events).await, SessionEvent::Ready));
    assert!(matches!(next_event(&mut pair.agent_events).await, SessionEvent::Ready));
}

#[tokio::test]
async fn version_mismatch_is_rejected_on_both_sides() {
    let (agent_sink, gateway_stream) = pipe();
    let (gateway_sink, agent_stream) = pipe();
    let (gateway, agent) = tokio::join!(
        TunnelSession::accept(gateway_sink, gateway_stream, config(7)),
        TunnelSession::initiate(agent_sink, agent_stream, config(6)),
    );
    assert!(matches!(
        gateway.unwrap_err(),
        TunnelError::ProtocolVersionMismatch {
            expected: 7,
            actual: 6
        }
    ));
    assert!(matches!(
        agent.unwrap_err(),
        TunnelError::IdentifyRejected(IdentifyFailureReason::BadVersion)
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_handshake() {
    let (_agent_sink, gateway_stream) = pipe();
    let (gateway_sink, _agent_stream) = pipe();
    let err = TunnelSession::accept(gateway_sink, gateway_stream, config(7))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::HandshakeTimeout(timeout) if timeout == WAIT));
}

#[tokio::test]
async fn new_connection_reaches_agent() {
    let (agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "203.0.113.5".into(),
        port: 80,
        channel_id: 1,
    })
    .await;

    let (channel_id, ip, port, connection) = next_new_connection(&mut events).await;
    assert_eq!(channel_id, 1);
    assert_eq!(ip, "203.0.113.5");
    assert_eq!(port, 80);
    assert_eq!(connection.channel_id(), 1);
    assert_eq!(agent.channel_count(), 1);
}

#[tokio::test]
async fn data_before_connection_end_is_delivered() {
    let (_agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "198.51.100.7".into(),
        port: 5000,
        channel_id: 5,
    })
    .await;
    let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    raw.send_raw(encode_frame(5, &payload)).await;
    raw.send_packet(ControlPacket::ConnectionEnd { channel_id: 5 }).await;

    let (channel_id, _, _, mut connection) = next_new_connection(&mut events).await;
    assert_eq!(channel_id, 5);
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, connection.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, payload);

    assert_eq!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::AckConnectionClose { channel_id: 5 }
    );
}

#[tokio::test]
async fn frames_for_unknown_channels_are_dropped() {
    let (agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_raw(encode_frame(9, b"nobody home")).await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "192.0.2.1".into(),
        port: 443,
        channel_id: 1,
    })
    .await;

    let (channel_id, ..) = next_new_connection(&mut events).await;
    assert_eq!(channel_id, 1);
    assert_eq!(agent.state(), SessionState::Ready);
}

#[tokio::test]
async fn unknown_control_packet_is_ignored() {
    let (agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_raw(encode_frame(CONTROL_CHANNEL, &[0x7f, 0x01])).await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "192.0.2.1".into(),
        port: 443,
        channel_id: 2,
    })
    .await;

    let (channel_id, ..) = next_new_connection(&mut events).await;
    assert_eq!(channel_id, 2);
    assert!(!agent.is_ended());
}

#[tokio::test]
async fn malformed_frame_header_ends_session() {
    let (agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_raw(vec![0xff; 10]).await;

    loop {
        if let SessionEvent::Ended { reason } = next_event(&mut events).await {
            assert!(reason.contains("malformed"), "reason: {reason}");
            break;
        }
    }
    assert!(agent.is_ended());
    assert_eq!(agent.state(), SessionState::Ended);
}

#[tokio::test]
async fn session_end_closes_every_channel_once() {
    let mut pair = connected_pair().await;
    let mut connections = Vec::new();
    for port in [1001, 1002, 1003] {
        connections.push(pair.gateway.open_channel("10.0.0.1", port).await.unwrap());
    }
    assert_eq!(pair.gateway.channel_count(), 3);

    pair.agent.close();

    let mut closed = Vec::new();
    loop {
        match next_event(&mut pair.gateway_events).await {
            SessionEvent::ConnectionClosed { channel_id, cause } => {
                assert_eq!(cause, CloseCause::SessionEnded);
                closed.push(channel_id);
            }
            SessionEvent::Ended { .. } => break,
            _ => {}
        }
    }
    closed.sort_unstable();
    assert_eq!(closed, vec![1, 2, 3]);
    assert_eq!(pair.gateway.channel_count(), 0);
    assert!(connections.iter().all(|c| c.is_closed()));

    // Late drops after the end must not produce more events.
    drop(connections);
    assert!(pair.gateway_events.try_recv().is_err());
}

#[tokio::test]
async fn channel_id_is_reused_after_close_is_acknowledged() {
    let pair = connected_pair().await;
    let first = pair.gateway.open_channel("10.0.0.1", 1).await.unwrap();
    assert_eq!(first.channel_id(), 1);
    let second = pair.gateway.open_channel("10.0.0.1", 2).await.unwrap();
    assert_eq!(second.channel_id(), 2);

    drop(first);
    assert_eq!(pair.gateway.awaiting_ack_count(), 1);
    tokio::time::timeout(WAIT, async {
        while pair.gateway.awaiting_ack_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent never acknowledged the close");

    let reused = pair.gateway.open_channel("10.0.0.1", 3).await.unwrap();
    assert_eq!(reused.channel_id(), 1);
}

#[tokio::test]
async fn bytes_flow_both_ways_over_a_channel() {
    let mut pair = connected_pair().await;
    let mut gateway_side = pair.gateway.open_channel("10.0.0.1", 80).await.unwrap();
    let (_, _, _, mut agent_side) = next_new_connection(&mut pair.agent_events).await;

    gateway_side.write(b"ping").await.unwrap();
    assert_eq!(agent_side.recv().await.unwrap(), Bytes::from_static(b"ping"));

    let big = vec![7u8; 200 * 1024];
    agent_side.write(&big).await.unwrap();
    let mut received = Vec::new();
    while received.len() < big.len() {
        let chunk = tokio::time::timeout(WAIT, gateway_side.recv())
            .await
            .unwrap()
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, big);
}

#[tokio::test]
async fn agent_cannot_open_channels() {
    let pair = connected_pair().await;
    assert!(matches!(
        pair.agent.open_channel("10.0.0.1", 80).await.unwrap_err(),
        TunnelError::UnexpectedPacket(_)
    ));
}

#[tokio::test]
async fn write_after_local_close_fails() {
    let pair = connected_pair().await;
    let mut connection = pair.gateway.open_channel("10.0.0.1", 80).await.unwrap();
    connection.close();
    connection.close();
    assert_eq!(pair.gateway.awaiting_ack_count(), 1);

    assert!(matches!(
        connection.write(b"late").await,
        Err(TunnelError::ChannelClosed(1))
    ));
    let err = connection.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn write_after_peer_end_fails() {
    let (_agent, mut events, mut raw) = agent_with_raw_gateway().await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "192.0.2.1".into(),
        port: 443,
        channel_id: 4,
    })
    .await;
    let (_, _, _, connection) = next_new_connection(&mut events).await;

    raw.send_packet(ControlPacket::ConnectionEnd { channel_id: 4 }).await;
    assert_eq!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::AckConnectionClose { channel_id: 4 }
    );
    tokio::time::timeout(WAIT, connection.closed()).await.unwrap();

    assert!(matches!(
        connection.write(b"late").await,
        Err(TunnelError::ChannelClosed(4))
    ));
}

#[tokio::test]
async fn repeated_close_sends_one_connection_end() {
    let (_agent, mut events, mut raw) = agent_with_raw_gateway().await;
    for channel_id in [3, 4] {
        raw.send_packet(ControlPacket::NewConnection {
            ip: "192.0.2.1".into(),
            port: 443,
            channel_id,
        })
        .await;
    }
    let (_, _, _, first) = next_new_connection(&mut events).await;
    let (_, _, _, second) = next_new_connection(&mut events).await;

    first.close();
    first.close();
    drop(first);
    second.close();

    assert_eq!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::ConnectionEnd { channel_id: 3 }
    );
    assert_eq!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::ConnectionEnd { channel_id: 4 }
    );

    let mut closed_first = 0;
    loop {
        if let SessionEvent::ConnectionClosed { channel_id, cause } = next_event(&mut events).await {
            assert_eq!(cause, CloseCause::Local);
            match channel_id {
                3 => closed_first += 1,
                4 => break,
                other => panic!("unexpected close of channel {other}"),
            }
        }
    }
    assert_eq!(closed_first, 1);
}

/// Opens channel 1, starts a large write on it while the gateway writer is
/// stalled, lets the agent end the channel and reopens id 1. Returns whether
/// the old write failed and how many channel 1 bytes followed the second
/// `NewConnection`.
async fn write_across_id_reuse(
    start_write: impl FnOnce(forwarder::VirtualConnection, Vec<u8>) -> JoinHandle<bool>,
) -> (bool, usize) {
    let (gateway, _events, mut raw) = gateway_with_raw_agent().await;
    let old = gateway.open_channel("10.0.0.1", 80).await.unwrap();
    assert_eq!(old.channel_id(), 1);
    assert!(matches!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::NewConnection { channel_id: 1, .. }
    ));

    let write = start_write(old, vec![0xaa; 6 * 64 * 1024]);
    raw.send_packet(ControlPacket::ConnectionEnd { channel_id: 1 }).await;
    tokio::time::timeout(WAIT, async {
        while gateway.channel_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("gateway never saw the agent end the channel");

    let reopen = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.open_channel("10.0.0.1", 81).await.unwrap().channel_id() }
    });

    let mut reopened = false;
    let mut stale = 0;
    while let Some(frame) = raw.next_frame_within(Duration::from_millis(300)).await {
        if frame.channel_id == CONTROL_CHANNEL {
            let packet = ControlPacket::decode(Phase::Ready, Direction::ToAgent, frame.payload).unwrap();
            if matches!(packet, ControlPacket::NewConnection { channel_id: 1, .. }) {
                reopened = true;
            }
        } else if frame.channel_id == 1 && reopened {
            stale += frame.payload.len();
        }
    }

    assert_eq!(tokio::time::timeout(WAIT, reopen).await.unwrap().unwrap(), 1);
    assert!(reopened);
    let failed = tokio::time::timeout(WAIT, write).await.unwrap().unwrap();
    (failed, stale)
}

#[tokio::test]
async fn write_does_not_leak_onto_reused_channel() {
    let (failed, stale) = write_across_id_reuse(|old, data| {
        tokio::spawn(async move {
            matches!(old.write(&data).await, Err(TunnelError::ChannelClosed(1)))
        })
    })
    .await;
    assert!(failed);
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn async_write_does_not_leak_onto_reused_channel() {
    let (failed, stale) = write_across_id_reuse(|mut old, data| {
        tokio::spawn(async move { old.write_all(&data).await.is_err() })
    })
    .await;
    assert!(failed);
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn stalled_reader_is_closed_without_blocking_other_channels() {
    let (agent, mut events, mut raw) = agent_with_raw_gateway_using(HandshakeConfig {
        channel_buffer: 1,
        stall_timeout: Duration::from_millis(200),
        ..config(7)
    })
    .await;
    raw.send_packet(ControlPacket::NewConnection {
        ip: "192.0.2.1".into(),
        port: 443,
        channel_id: 1,
    })
    .await;
    let (_, _, _, mut stalled) = next_new_connection(&mut events).await;

    for chunk in [b"one", b"two", b"six"] {
        raw.send_raw(encode_frame(1, chunk)).await;
    }
    raw.send_packet(ControlPacket::NewConnection {
        ip: "192.0.2.1".into(),
        port: 443,
        channel_id: 2,
    })
    .await;

    assert_eq!(
        raw.next_packet(Phase::Ready).await,
        ControlPacket::ConnectionEnd { channel_id: 1 }
    );
    loop {
        if let SessionEvent::ConnectionClosed { channel_id, cause } = next_event(&mut events).await {
            assert_eq!((channel_id, cause), (1, CloseCause::Local));
            break;
        }
    }
    let (channel_id, ..) = next_new_connection(&mut events).await;
    assert_eq!(channel_id, 2);
    assert_eq!(agent.channel_count(), 1);

    // What was queued before the stall is still readable.
    assert_eq!(stalled.recv().await.unwrap(), Bytes::from_static(b"one"));
    assert!(stalled.recv().await.is_none());
}
