//! Integration tests for the connection manager over an in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidewire_connection::{
    decode_frame, encode_frame, ClientOptions, ConnectionError, ConnectionManager, ConnectionState,
    InboundEvent, StaticConnectivity,
};
use tidewire_protocol::{
    codes, Action, ConnectionDetails, Data, ErrorInfo, Format, Message, PresenceAction,
    PresenceMessage, ProtocolMessage,
};
use tidewire_transport::{
    AtomicTransportState, Frame, Link, LinkId, Transport, TransportError, TransportState, Url,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// In-memory transport
// =========================================================================

struct MockLink {
    id: LinkId,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Frame>,
    state: AtomicTransportState,
}

impl Link for MockLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed("server side gone".into()))
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        let frame = self.inbound.lock().await.recv().await;
        if frame.is_none() {
            self.state.set(TransportState::Closed);
        }
        Ok(frame)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.set(TransportState::Closed);
        Ok(())
    }

    fn id(&self) -> LinkId {
        self.id
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }
}

/// The server end of one accepted link.
struct ServerConn {
    url: Url,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerConn {
    fn send(&self, msg: &ProtocolMessage) {
        let frame = encode_frame(Format::Json, msg).unwrap();
        self.to_client.send(frame).unwrap();
    }

    fn send_raw(&self, frame: Frame) {
        self.to_client.send(frame).unwrap();
    }

    async fn recv(&mut self) -> ProtocolMessage {
        let frame = timeout(WAIT, self.from_client.recv())
            .await
            .expect("no frame from client")
            .expect("client link closed");
        decode_frame(&frame).unwrap()
    }

    /// Next frame with `action`, skipping heartbeats and the like.
    async fn recv_action(&mut self, action: Action) -> ProtocolMessage {
        loop {
            let msg = self.recv().await;
            if msg.action == action {
                return msg;
            }
        }
    }

    fn query(&self) -> HashMap<String, String> {
        self.url.query_pairs().into_owned().collect()
    }
}

#[derive(Clone)]
struct MockTransport {
    accepted: mpsc::UnboundedSender<ServerConn>,
    failures: Arc<Mutex<VecDeque<TransportError>>>,
    attempts: Arc<AtomicU64>,
}

impl Transport for MockTransport {
    type Link = MockLink;

    async fn connect(&self, url: &Url) -> Result<MockLink, TransportError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerConn {
            url: url.clone(),
            to_client,
            from_client,
        });
        Ok(MockLink {
            id: LinkId::new(n + 1),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            state: AtomicTransportState::new(TransportState::Connected),
        })
    }
}

struct Harness {
    manager: ConnectionManager,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
    failures: Arc<Mutex<VecDeque<TransportError>>>,
    attempts: Arc<AtomicU64>,
}

impl Harness {
    fn start(options: ClientOptions) -> Self {
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let transport = MockTransport {
            accepted: accepted_tx,
            failures: Arc::default(),
            attempts: Arc::default(),
        };
        let failures = transport.failures.clone();
        let attempts = transport.attempts.clone();
        let manager =
            ConnectionManager::with_probe(transport, StaticConnectivity(true), options).unwrap();
        Self {
            manager,
            accepted,
            failures,
            attempts,
        }
    }

    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("no connection attempt")
            .expect("transport dropped")
    }

    async fn wait_for(&self, state: ConnectionState) {
        timeout(WAIT, self.manager.wait_for_state(state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state}, stuck in {}", self.manager.state()))
            .unwrap();
    }

    /// Accepts the next link and completes the handshake.
    async fn connect(&mut self, id: &str, key: &str) -> ServerConn {
        let server = self.accept().await;
        server.send(&connected(id, key));
        self.wait_for(ConnectionState::Connected).await;
        server
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        host: Some("realtime.test".into()),
        tls: false,
        ..ClientOptions::with_key("app.key:secret")
    }
}

fn connected(id: &str, key: &str) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new(Action::Connected);
    msg.connection_id = Some(id.into());
    msg.connection_details = Some(ConnectionDetails {
        connection_key: Some(key.into()),
        ..Default::default()
    });
    msg
}

fn ack(action: Action, serial: i64, count: i32) -> ProtocolMessage {
    let mut msg = ProtocolMessage::new(action);
    msg.msg_serial = Some(serial);
    msg.count = count;
    msg
}

fn publish(text: &str) -> ProtocolMessage {
    ProtocolMessage::publish("chat", vec![Message::new("greeting", text)])
}

// =========================================================================
// Connecting
// =========================================================================

#[tokio::test]
async fn test_connect_sends_credentials_and_reaches_connected() {
    let mut h = Harness::start(options());
    let server = h.accept().await;

    assert_eq!(server.url.scheme(), "ws");
    assert_eq!(server.url.host_str(), Some("realtime.test"));
    let q = server.query();
    assert_eq!(q["key"], "app.key:secret");
    assert_eq!(q["format"], "json");
    assert_eq!(q["v"], "2");
    assert!(!q.contains_key("resume"));

    server.send(&connected("conn-1", "key-1"));
    h.wait_for(ConnectionState::Connected).await;

    let info = h.manager.connection_info().unwrap();
    assert_eq!(info.id, "conn-1");
    assert_eq!(info.key.as_deref(), Some("key-1"));
}

#[tokio::test]
async fn test_connect_without_auto_connect_waits_for_connect_call() {
    let mut h = Harness::start(ClientOptions {
        auto_connect: false,
        ..options()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.state(), ConnectionState::Initialized);
    assert_eq!(h.attempts.load(Ordering::SeqCst), 0);

    h.manager.connect().await.unwrap();
    h.connect("conn-1", "key-1").await;
}

#[tokio::test]
async fn test_new_without_credentials_is_rejected() {
    let (accepted, _rx) = mpsc::unbounded_channel();
    let transport = MockTransport {
        accepted,
        failures: Arc::default(),
        attempts: Arc::default(),
    };
    let result =
        ConnectionManager::with_probe(transport, StaticConnectivity(true), ClientOptions::default());
    assert!(matches!(result, Err(ConnectionError::InvalidOptions(_))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_retries_after_backoff() {
    let mut h = Harness::start(options());
    h.failures.lock().unwrap().push_back(TransportError::ConnectFailed {
        status: None,
        reason: "refused".into(),
    });
    let mut changes = h.manager.on_state_change();

    let change = changes.recv().await.unwrap();
    assert_eq!(change.current, ConnectionState::Connecting);

    let change = changes.recv().await.unwrap();
    assert_eq!(change.current, ConnectionState::Disconnected);
    assert_eq!(change.reason.as_ref().unwrap().code, codes::CONNECTION_ERROR);
    let retry_in = change.retry_in.unwrap();
    assert!(retry_in >= Duration::from_secs(11) && retry_in <= Duration::from_secs(15), "{retry_in:?}");
    let disconnected_at = Instant::now();

    let change = changes.recv().await.unwrap();
    assert_eq!(change.current, ConnectionState::Connecting);
    assert!(disconnected_at.elapsed() >= Duration::from_secs(11));

    let server = h.accepted.recv().await.unwrap();
    assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
    server.send(&connected("conn-1", "key-1"));
    let change = changes.recv().await.unwrap();
    assert_eq!(change.current, ConnectionState::Connected);
}

// =========================================================================
// Sending
// =========================================================================

#[tokio::test]
async fn test_send_before_connected_is_queued_then_flushed() {
    let mut h = Harness::start(options());
    let mut server = h.accept().await;

    let outcome = h.manager.submit(publish("hi")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.from_client.try_recv().is_err(), "sent before connected");

    server.send(&connected("conn-1", "key-1"));
    let sent = server.recv_action(Action::Message).await;
    assert_eq!(sent.msg_serial, Some(0));
    assert_eq!(sent.channel.as_deref(), Some("chat"));

    server.send(&ack(Action::Ack, 0, 1));
    timeout(WAIT, outcome).await.unwrap().unwrap().unwrap();
    assert_eq!(h.manager.pending_ack_count(), 0);
}

#[tokio::test]
async fn test_ack_resolves_sends_in_order() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let first = h.manager.submit(publish("one")).await.unwrap();
    let second = h.manager.submit(publish("two")).await.unwrap();
    assert_eq!(server.recv_action(Action::Message).await.msg_serial, Some(0));
    assert_eq!(server.recv_action(Action::Message).await.msg_serial, Some(1));
    assert_eq!(h.manager.pending_ack_count(), 2);

    server.send(&ack(Action::Ack, 0, 2));
    timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    timeout(WAIT, second).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_nack_fails_the_send_with_server_error() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let manager = h.manager.clone();
    let send = tokio::spawn(async move { manager.send(publish("rejected")).await });
    let sent = server.recv_action(Action::Message).await;

    let mut nack = ack(Action::Nack, sent.msg_serial.unwrap(), 1);
    nack.error = Some(ErrorInfo::new(codes::INTERNAL_ERROR, Some(500), "storage unavailable"));
    server.send(&nack);

    let result = timeout(WAIT, send).await.unwrap().unwrap();
    match result {
        Err(ConnectionError::Rejected(error)) => {
            assert_eq!(error.code, codes::INTERNAL_ERROR);
            assert_eq!(error.status_code, Some(500));
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_with_other_client_id_is_refused() {
    let mut h = Harness::start(ClientOptions {
        client_id: Some("alice".into()),
        ..options()
    });
    let _server = h.connect("conn-1", "key-1").await;

    let mut msg = Message::new("greeting", "hi");
    msg.client_id = Some("mallory".into());
    let result = h.manager.send(ProtocolMessage::publish("chat", vec![msg])).await;
    match result {
        Err(ConnectionError::Rejected(error)) => assert_eq!(error.code, codes::INCOMPATIBLE_CLIENT_ID),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_presence_is_refused() {
    let mut h = Harness::start(options());
    let _server = h.connect("conn-1", "key-1").await;

    let member = PresenceMessage {
        action: PresenceAction::Enter,
        data: Some(Data::from("x".repeat(70_000))),
        ..Default::default()
    };
    let result = h.manager.send(ProtocolMessage::presence("chat", vec![member])).await;
    match result {
        Err(ConnectionError::Rejected(error)) => {
            assert_eq!(error.code, codes::MAX_MESSAGE_SIZE_EXCEEDED);
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(h.manager.pending_ack_count(), 0);
}

#[tokio::test]
async fn test_failed_write_of_unacked_frame_reports_transport_error() {
    let mut h = Harness::start(options());
    let server = h.connect("conn-1", "key-1").await;
    // The server stops reading; writes to the link now fail.
    let ServerConn {
        to_client: _to_client,
        from_client,
        ..
    } = server;
    drop(from_client);

    let mut attach = ProtocolMessage::new(Action::Attach);
    attach.channel = Some("chat".into());
    match timeout(WAIT, h.manager.send(attach)).await.unwrap() {
        Err(ConnectionError::Rejected(error)) => {
            assert_eq!(error.code, codes::DISCONNECTED);
            assert!(error.message.contains("server side gone"), "{}", error.message);
        }
        other => panic!("expected a transport failure, got {other:?}"),
    }
    // The dead link is dropped and a new one opened.
    h.accept().await;
}

#[tokio::test]
async fn test_send_without_queueing_fails_while_connecting() {
    let mut h = Harness::start(ClientOptions {
        queue_messages: false,
        ..options()
    });
    let _server = h.accept().await;
    h.wait_for(ConnectionState::Connecting).await;

    let result = h.manager.send(publish("early")).await;
    match result {
        Err(ConnectionError::Rejected(error)) => assert_eq!(error.code, codes::DISCONNECTED),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

// =========================================================================
// Resume
// =========================================================================

#[tokio::test]
async fn test_lost_link_resumes_and_resends_unacked_messages() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;
    let mut changes = h.manager.on_state_change();

    let outcome = h.manager.submit(publish("in flight")).await.unwrap();
    assert_eq!(server.recv_action(Action::Message).await.msg_serial, Some(0));

    let mut inbound = ProtocolMessage::publish("chat", vec![Message::new("news", "x")]);
    inbound.connection_serial = Some(7);
    server.send(&inbound);
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(server);
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.current, ConnectionState::Disconnected);
    assert_eq!(change.retry_in, Some(Duration::ZERO));

    let mut server = h.accept().await;
    let q = server.query();
    assert_eq!(q["resume"], "key-1");
    assert_eq!(q["connection_serial"], "7");

    server.send(&connected("conn-1", "key-1"));
    let resent = server.recv_action(Action::Message).await;
    assert_eq!(resent.msg_serial, Some(0));
    assert_eq!(resent.messages[0].data, Some(Data::from("in flight")));

    server.send(&ack(Action::Ack, 0, 1));
    timeout(WAIT, outcome).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_resume_resends_unacked_before_flushing_queued() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let unacked = h.manager.submit(publish("before")).await.unwrap();
    assert_eq!(server.recv_action(Action::Message).await.msg_serial, Some(0));
    drop(server);

    // Link open but not yet confirmed: new sends wait in the queue.
    let mut server = h.accept().await;
    let queued = h.manager.submit(publish("after")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.from_client.try_recv().is_err(), "sent before connected");

    server.send(&connected("conn-1", "key-1"));
    let first = server.recv_action(Action::Message).await;
    let second = server.recv_action(Action::Message).await;
    assert_eq!(first.msg_serial, Some(0));
    assert_eq!(first.messages[0].data, Some(Data::from("before")));
    assert_eq!(second.msg_serial, Some(1));
    assert_eq!(second.messages[0].data, Some(Data::from("after")));

    server.send(&ack(Action::Ack, 0, 2));
    timeout(WAIT, unacked).await.unwrap().unwrap().unwrap();
    timeout(WAIT, queued).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_resume_with_new_connection_id_renumbers_resent_messages() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let _first = h.manager.submit(publish("a")).await.unwrap();
    let _second = h.manager.submit(publish("b")).await.unwrap();
    server.recv_action(Action::Message).await;
    server.recv_action(Action::Message).await;
    server.send(&ack(Action::Ack, 0, 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.pending_ack_count(), 1);

    drop(server);
    let mut server = h.accept().await;
    server.send(&connected("conn-2", "key-2"));
    let resent = server.recv_action(Action::Message).await;
    assert_eq!(resent.msg_serial, Some(0));
    assert_eq!(h.manager.connection_info().unwrap().id, "conn-2");
}

// =========================================================================
// Inbound traffic
// =========================================================================

#[tokio::test]
async fn test_inbound_channel_message_is_decoded_for_subscribers() {
    let mut h = Harness::start(options());
    let server = h.connect("conn-1", "key-1").await;
    let mut inbound = h.manager.subscribe();

    let mut msg = Message::new("blob", "aGVsbG8=");
    msg.encoding = Some("base64".into());
    server.send(&ProtocolMessage::publish("chat", vec![msg]));

    match timeout(WAIT, inbound.recv()).await.unwrap().unwrap() {
        InboundEvent::Message(frame) => {
            assert_eq!(frame.channel.as_deref(), Some("chat"));
            assert_eq!(frame.messages[0].data, Some(Data::Binary(b"hello".to_vec())));
            assert_eq!(frame.messages[0].encoding, None);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_state_and_acks_settle_before_listeners_hear_later_frames() {
    let mut h = Harness::start(options());
    let mut server = h.accept().await;
    let mut inbound = h.manager.subscribe();
    let mut outcome = h.manager.submit(publish("queued")).await.unwrap();

    server.send(&connected("conn-1", "key-1"));
    let sent = server.recv_action(Action::Message).await;
    server.send(&ack(Action::Ack, sent.msg_serial.unwrap(), 1));
    server.send(&ProtocolMessage::publish("chat", vec![Message::new("news", "x")]));

    // Neither Connected nor Ack reach listeners; the channel message is first.
    match timeout(WAIT, inbound.recv()).await.unwrap().unwrap() {
        InboundEvent::Message(frame) => {
            assert_eq!(frame.messages[0].name.as_deref(), Some("news"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.manager.state(), ConnectionState::Connected);
    assert_eq!(h.manager.pending_ack_count(), 0);
    assert_eq!(outcome.try_recv().unwrap(), Ok(()));
}

#[tokio::test]
async fn test_undecodable_frame_is_reported_and_connection_survives() {
    let mut h = Harness::start(options());
    let server = h.connect("conn-1", "key-1").await;
    let mut inbound = h.manager.subscribe();

    server.send_raw(Frame::Text("{definitely not a frame".into()));
    match timeout(WAIT, inbound.recv()).await.unwrap().unwrap() {
        InboundEvent::FrameRejected { reason } => assert!(!reason.is_empty()),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_ping_measures_heartbeat_round_trip() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let manager = h.manager.clone();
    let ping = tokio::spawn(async move { manager.ping().await });
    let heartbeat = server.recv_action(Action::Heartbeat).await;
    assert!(heartbeat.id.is_some());
    server.send(&heartbeat);

    let rtt = timeout(WAIT, ping).await.unwrap().unwrap().unwrap();
    assert!(rtt < WAIT);
}

#[tokio::test]
async fn test_server_error_frame_fails_the_connection() {
    let mut h = Harness::start(options());
    let server = h.connect("conn-1", "key-1").await;

    let mut error = ProtocolMessage::new(Action::Error);
    error.error = Some(ErrorInfo::new(codes::BAD_REQUEST, Some(400), "account disabled"));
    server.send(&error);

    h.wait_for(ConnectionState::Failed).await;
    assert!(h.manager.connection_info().is_none());
    match h.manager.send(publish("late")).await {
        Err(ConnectionError::Rejected(e)) => assert_eq!(e.code, codes::BAD_REQUEST),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

// =========================================================================
// Closing
// =========================================================================

#[tokio::test]
async fn test_close_sends_close_frame_and_reaches_closed() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    h.manager.close().await.unwrap();
    h.wait_for(ConnectionState::Closing).await;
    server.recv_action(Action::Close).await;
    server.send(&ProtocolMessage::new(Action::Closed));

    h.wait_for(ConnectionState::Closed).await;
    assert!(h.manager.connection_info().is_none());

    match h.manager.send(publish("after close")).await {
        Err(ConnectionError::Rejected(e)) => assert_eq!(e, ConnectionState::Closed.error()),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_close_fails_unacked_messages() {
    let mut h = Harness::start(options());
    let mut server = h.connect("conn-1", "key-1").await;

    let outcome = h.manager.submit(publish("unacked")).await.unwrap();
    server.recv_action(Action::Message).await;

    h.manager.close().await.unwrap();
    server.recv_action(Action::Close).await;
    server.send(&ProtocolMessage::new(Action::Closed));

    let result = timeout(WAIT, outcome).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err().code, codes::CONNECTION_CLOSED);
}
