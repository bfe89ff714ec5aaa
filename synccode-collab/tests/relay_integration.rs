//! Integration tests against a real relay.
//!
//! These tests start a WebSocket relay on a free port and connect real
//! clients, verifying admission, forwarding and disconnect handling.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use synccode_collab::{
    CallError, CallSignal, ConnectionState, LocalMedia, MediaConstraints, MediaDevices, MediaError,
    MediaTrack, ParticipantId, ParticipantInfo, PeerConnector, PeerLink, RelayConfig, RoomId,
    RoomMessage, RoomSession, SessionConfig, SessionDescription, SessionEvent, SessionStatus,
    SyncClient, SyncMessage, SyncServer, TrackKind, Transport, RELAY_ID,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        room_capacity: 2,
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
        liveness_timeout_secs: 90,
    };
    let server = SyncServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

/// A connected client and the inbox its traffic lands in.
async fn connect(url: &str, room: &RoomId, name: &str) -> (SyncClient, ParticipantInfo, mpsc::Receiver<SessionEvent>) {
    let info = ParticipantInfo::new(name);
    let (tx, rx) = mpsc::channel(64);
    let client = SyncClient::new(info.participant_id, room.clone(), url, tx);
    client.connect().await.unwrap();
    (client, info, rx)
}

/// Receive until a message matching `pred` arrives.
async fn recv_until(
    rx: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SyncMessage) -> bool,
) -> SyncMessage {
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SessionEvent::Inbound(msg))) if pred(&msg) => return msg,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("inbox closed"),
            Err(_) => panic!("timed out waiting for message"),
        }
    }
}

async fn join(client: &SyncClient, room: &RoomId, info: &ParticipantInfo, rx: &mut mpsc::Receiver<SessionEvent>) -> RoomMessage {
    client.send(SyncMessage::join(room.clone(), info.clone())).unwrap();
    recv_until(rx, |m| {
        matches!(m.payload, RoomMessage::Members(_) | RoomMessage::RoomFull { .. })
    })
    .await
    .payload
}

#[tokio::test]
async fn test_join_receives_member_list() {
    let url = start_test_server().await;
    let room = RoomId::new("members");

    let (alice, alice_info, mut alice_rx) = connect(&url, &room, "Alice").await;
    assert_eq!(alice.connection_state(), ConnectionState::Connected);
    assert_eq!(join(&alice, &room, &alice_info, &mut alice_rx).await, RoomMessage::Members(vec![]));

    let (bob, bob_info, mut bob_rx) = connect(&url, &room, "Bob").await;
    assert_eq!(
        join(&bob, &room, &bob_info, &mut bob_rx).await,
        RoomMessage::Members(vec![alice_info.clone()])
    );

    // Alice hears about Bob.
    let msg = recv_until(&mut alice_rx, |m| matches!(m.payload, RoomMessage::Join(_))).await;
    assert_eq!(msg.sender, bob_info.participant_id);
    assert_eq!(msg.payload, RoomMessage::Join(bob_info));
}

#[tokio::test]
async fn test_third_participant_gets_room_full() {
    let url = start_test_server().await;
    let room = RoomId::new("full");

    let (a, a_info, mut a_rx) = connect(&url, &room, "A").await;
    join(&a, &room, &a_info, &mut a_rx).await;
    let (b, b_info, mut b_rx) = connect(&url, &room, "B").await;
    join(&b, &room, &b_info, &mut b_rx).await;

    let (c, c_info, mut c_rx) = connect(&url, &room, "C").await;
    assert_eq!(
        join(&c, &room, &c_info, &mut c_rx).await,
        RoomMessage::RoomFull { capacity: 2 }
    );

    // The relay hangs up on the rejected participant.
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match c_rx.recv().await {
                Some(SessionEvent::TransportClosed) | None => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // Traffic between the admitted pair still flows.
    let hangup = SyncMessage::new(room.clone(), a_info.participant_id, RoomMessage::Call(CallSignal::Hangup));
    a.send(hangup).unwrap();
    let msg = recv_until(&mut b_rx, |m| matches!(m.payload, RoomMessage::Call(_))).await;
    assert_eq!(msg.sender, a_info.participant_id);
}

#[tokio::test]
async fn test_ping_is_answered_by_relay() {
    let url = start_test_server().await;
    let room = RoomId::new("ping");

    let (client, info, mut rx) = connect(&url, &room, "Solo").await;
    join(&client, &room, &info, &mut rx).await;
    client.ping().unwrap();

    let pong = recv_until(&mut rx, |m| m.payload == RoomMessage::Pong).await;
    assert_eq!(pong.sender, RELAY_ID);
}

#[tokio::test]
async fn test_dropped_connection_is_announced() {
    let url = start_test_server().await;
    let room = RoomId::new("drop");

    let (a, a_info, mut a_rx) = connect(&url, &room, "A").await;
    join(&a, &room, &a_info, &mut a_rx).await;
    let (b, b_info, mut b_rx) = connect(&url, &room, "B").await;
    join(&b, &room, &b_info, &mut b_rx).await;

    b.disconnect();

    let msg = recv_until(&mut a_rx, |m| {
        matches!(m.payload, RoomMessage::ParticipantDisconnected(_))
    })
    .await;
    assert_eq!(msg.sender, RELAY_ID);
    assert_eq!(msg.payload, RoomMessage::ParticipantDisconnected(b_info.participant_id));
}

#[tokio::test]
async fn test_spoofed_sender_is_not_forwarded() {
    let url = start_test_server().await;
    let room = RoomId::new("spoof");

    let (a, a_info, mut a_rx) = connect(&url, &room, "A").await;
    join(&a, &room, &a_info, &mut a_rx).await;
    let (b, b_info, mut b_rx) = connect(&url, &room, "B").await;
    join(&b, &room, &b_info, &mut b_rx).await;

    let forged = SyncMessage::new(room.clone(), b_info.participant_id, RoomMessage::Call(CallSignal::Hangup));
    a.send(forged).unwrap();
    let genuine = SyncMessage::new(room.clone(), a_info.participant_id, RoomMessage::Pong);
    a.send(genuine).unwrap();
    let real = SyncMessage::new(room.clone(), a_info.participant_id, RoomMessage::Leave);
    a.send(real).unwrap();

    // Only the genuine Leave arrives; the forged hangup and the control
    // message were dropped by the relay.
    let msg = recv_until(&mut b_rx, |m| !matches!(m.payload, RoomMessage::Join(_))).await;
    assert_eq!(msg.payload, RoomMessage::Leave);
    assert_eq!(msg.sender, a_info.participant_id);
}

// ─── Full sessions over the network ──────────────────────────────

struct InstantDevices;

#[async_trait]
impl MediaDevices for InstantDevices {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        Ok(LocalMedia::new(vec![MediaTrack::new(TrackKind::Audio)]))
    }
}

struct NullConnector;

struct NullLink;

impl PeerConnector for NullConnector {
    fn connect(&self, _local: ParticipantId, _remote: ParticipantId, _media: &LocalMedia) -> Result<Box<dyn PeerLink>, CallError> {
        Ok(Box::new(NullLink))
    }
}

impl PeerLink for NullLink {
    fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription("offer".into()))
    }
    fn accept_offer(&mut self, _offer: &SessionDescription) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription("answer".into()))
    }
    fn accept_answer(&mut self, _answer: &SessionDescription) -> Result<(), CallError> {
        Ok(())
    }
    fn close(&mut self) {}
}

struct NetPeer {
    session: RoomSession,
    events: mpsc::Receiver<SessionEvent>,
}

async fn net_peer(url: &str, room: &RoomId, name: &str) -> NetPeer {
    let info = ParticipantInfo::new(name);
    let (tx, rx) = mpsc::channel(256);
    let client = Arc::new(SyncClient::new(info.participant_id, room.clone(), url, tx.clone()));
    client.connect().await.unwrap();
    let mut session = RoomSession::new(
        room.clone(),
        info,
        SessionConfig::default(),
        client,
        Arc::new(InstantDevices),
        Arc::new(NullConnector),
        tx,
    );
    session.join().unwrap();
    NetPeer { session, events: rx }
}

/// Feed every peer its events for `period`.
async fn drive(peers: &mut [&mut NetPeer], period: Duration) {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        for peer in peers.iter_mut() {
            while let Ok(event) = peer.events.try_recv() {
                let _ = peer.session.handle_event(event);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_sessions_share_a_buffer_through_relay() {
    let url = start_test_server().await;
    let room = RoomId::new("pair");

    let mut alice = net_peer(&url, &room, "Alice").await;
    drive(&mut [&mut alice], Duration::from_millis(200)).await;
    assert_eq!(alice.session.status(), SessionStatus::Active);
    alice.session.insert(0, "print('hi')").unwrap();

    let mut bob = net_peer(&url, &room, "Bob").await;
    drive(&mut [&mut alice, &mut bob], Duration::from_millis(400)).await;
    assert_eq!(bob.session.status(), SessionStatus::Active);
    assert_eq!(bob.session.snapshot(), "print('hi')");

    bob.session.insert(11, "\nprint('bye')").unwrap();
    alice.session.insert(0, "# greet\n").unwrap();
    drive(&mut [&mut alice, &mut bob], Duration::from_millis(400)).await;

    assert_eq!(alice.session.snapshot(), bob.session.snapshot());
    assert_eq!(alice.session.snapshot(), "# greet\nprint('hi')\nprint('bye')");
}
