//! End-to-end tests for the client surface over an in-memory transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tidewire::connection::{decode_frame, encode_frame, StaticConnectivity};
use tidewire::prelude::*;
use tidewire::protocol::{codes, Action, ConnectionDetails, ProtocolMessage};
use tidewire::transport::{
    AtomicTransportState, Frame, Link, LinkId, Transport, TransportError, TransportState, Url,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// In-memory transport
// =========================================================================

struct MemoryLink {
    id: LinkId,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    outbound: mpsc::UnboundedSender<Frame>,
    state: AtomicTransportState,
}

impl Link for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed("server side gone".into()))
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
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

struct Server {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl Server {
    fn send(&self, msg: &ProtocolMessage) {
        self.to_client.send(encode_frame(Format::Json, msg).unwrap()).unwrap();
    }

    async fn recv_action(&mut self, action: Action) -> ProtocolMessage {
        loop {
            let frame = timeout(WAIT, self.from_client.recv())
                .await
                .expect("no frame from client")
                .expect("client link closed");
            let msg = decode_frame(&frame).unwrap();
            if msg.action == action {
                return msg;
            }
        }
    }

    /// Answers the next frame with `action` on `channel` with `reply`.
    async fn answer(&mut self, action: Action, reply: Action) {
        let request = self.recv_action(action).await;
        let mut msg = ProtocolMessage::new(reply);
        msg.channel = request.channel;
        self.send(&msg);
    }
}

struct MemoryTransport {
    accepted: mpsc::UnboundedSender<Server>,
    next_id: AtomicU64,
}

impl Transport for MemoryTransport {
    type Link = MemoryLink;

    async fn connect(&self, _url: &Url) -> Result<MemoryLink, TransportError> {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(Server {
            to_client,
            from_client,
        });
        Ok(MemoryLink {
            id: LinkId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            state: AtomicTransportState::new(TransportState::Connected),
        })
    }
}

async fn connected_client(builder: RealtimeClientBuilder) -> (RealtimeClient, Server) {
    let (accepted, mut servers) = mpsc::unbounded_channel();
    let transport = MemoryTransport {
        accepted,
        next_id: AtomicU64::new(1),
    };
    let client = builder
        .key("app.key:secret")
        .host("realtime.test")
        .tls(false)
        .build_with(transport, StaticConnectivity(true))
        .unwrap();

    let server = timeout(WAIT, servers.recv()).await.unwrap().unwrap();
    let mut hello = ProtocolMessage::new(Action::Connected);
    hello.connection_id = Some("conn-1".into());
    hello.connection_details = Some(ConnectionDetails {
        connection_key: Some("key-1".into()),
        ..Default::default()
    });
    server.send(&hello);
    timeout(WAIT, client.connection().wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    (client, server)
}

// =========================================================================
// Channels
// =========================================================================

#[tokio::test]
async fn test_attach_resolves_on_attached() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let chat = client.channel("chat");

    let attach = tokio::spawn(async move { chat.attach().await });
    server.answer(Action::Attach, Action::Attached).await;
    timeout(WAIT, attach).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_attach_ignores_replies_for_other_channels() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let chat = client.channel("chat");

    let attach = tokio::spawn(async move { chat.attach().await });
    server.recv_action(Action::Attach).await;
    let mut other = ProtocolMessage::new(Action::Attached);
    other.channel = Some("news".into());
    server.send(&other);
    let mut ours = ProtocolMessage::new(Action::Attached);
    ours.channel = Some("chat".into());
    server.send(&ours);

    timeout(WAIT, attach).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_attach_fails_on_channel_error() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let chat = client.channel("chat");

    let attach = tokio::spawn(async move { chat.attach().await });
    let request = server.recv_action(Action::Attach).await;
    let mut refusal = ProtocolMessage::new(Action::Error);
    refusal.channel = request.channel;
    refusal.error = Some(ErrorInfo::new(40160, Some(401), "not permitted"));
    server.send(&refusal);

    let err = timeout(WAIT, attach).await.unwrap().unwrap().unwrap_err();
    match &err {
        TidewireError::Channel { channel, error } => {
            assert_eq!(channel, "chat");
            assert_eq!(error.code, 40160);
        }
        other => panic!("expected a channel error, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_attach_times_out_without_reply() {
    let (client, _server) =
        connected_client(RealtimeClient::builder().request_timeout(Duration::from_millis(200))).await;

    let err = client.channel("chat").attach().await.unwrap_err();
    assert_eq!(err.error_info().unwrap().code, codes::TIMEOUT);
}

#[tokio::test]
async fn test_detach_resolves_on_detached() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let chat = client.channel("chat");

    let detach = tokio::spawn(async move { chat.detach().await });
    server.answer(Action::Detach, Action::Detached).await;
    timeout(WAIT, detach).await.unwrap().unwrap().unwrap();
}

// =========================================================================
// Publish and subscribe
// =========================================================================

#[tokio::test]
async fn test_publish_resolves_on_ack() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let chat = client.channel("chat");

    let publish = tokio::spawn(async move { chat.publish("greeting", "hello").await });
    let sent = server.recv_action(Action::Message).await;
    assert_eq!(sent.messages[0].name.as_deref(), Some("greeting"));
    assert_eq!(sent.messages[0].data, Some(Data::from("hello")));

    let mut ack = ProtocolMessage::new(Action::Ack);
    ack.msg_serial = sent.msg_serial;
    ack.count = 1;
    server.send(&ack);
    timeout(WAIT, publish).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_subscription_yields_only_its_channel() {
    let (client, server) = connected_client(RealtimeClient::builder()).await;
    let mut chat = client.channel("chat").subscribe();

    server.send(&ProtocolMessage::publish("news", vec![Message::new("headline", "elsewhere")]));
    server.send(&ProtocolMessage::publish(
        "chat",
        vec![Message::new("a", "first"), Message::new("b", "second")],
    ));

    let first = timeout(WAIT, chat.next()).await.unwrap().unwrap();
    let second = timeout(WAIT, chat.next()).await.unwrap().unwrap();
    assert_eq!(first.data, Some(Data::from("first")));
    assert_eq!(second.data, Some(Data::from("second")));
}

#[tokio::test]
async fn test_encrypted_channel_round_trips_through_server() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let secret = client.channel("secret");
    let cipher = CipherParams::new(vec![7u8; 16]).unwrap();
    secret
        .set_options(ChannelOptions { cipher: Some(cipher) })
        .await
        .unwrap();
    let mut messages = secret.subscribe();

    let publisher = secret.clone();
    let _publish = tokio::spawn(async move { publisher.publish("note", "launch codes").await });
    let sent = server.recv_action(Action::Message).await;
    let encoding = sent.messages[0].encoding.clone().unwrap();
    assert!(encoding.contains("cipher+aes-128-cbc"), "{encoding}");
    assert_ne!(sent.messages[0].data, Some(Data::from("launch codes")));

    // Echo it back as the server would deliver it to subscribers.
    let mut echo = ProtocolMessage::publish("secret", sent.messages.clone());
    echo.msg_serial = None;
    server.send(&echo);

    let received = timeout(WAIT, messages.next()).await.unwrap().unwrap();
    assert_eq!(received.data, Some(Data::from("launch codes")));
    assert_eq!(received.encoding, None);
}

#[tokio::test]
async fn test_close_reaches_closed() {
    let (client, mut server) = connected_client(RealtimeClient::builder()).await;
    let mut changes = client.on_state_change();

    client.close().await.unwrap();
    server.recv_action(Action::Close).await;
    server.send(&ProtocolMessage::new(Action::Closed));

    loop {
        let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        if change.current == ConnectionState::Closed {
            break;
        }
    }
}
