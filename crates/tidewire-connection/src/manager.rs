//! The connection manager.
//!
//! Each connection is a single actor task that owns everything mutable: the
//! state machine, the queue of messages waiting for the connection, the
//! current link, the timers and the per-channel decode contexts.
//! [`ConnectionManager`] is a cheap, cloneable handle that talks to it over
//! a bounded `mpsc` channel.
//!
//! ```text
//!   ConnectionManager ──commands──▶ ┌──────────────────────┐
//!                                   │   connection actor    │──▶ link writer task
//!   link reader task ───events────▶ │  StateMachine         │
//!   connect / token / probe tasks ─▶│  pending queue        │──▶ broadcast: state changes
//!   timers ─────────────fired─────▶ │  channel contexts     │──▶ broadcast: inbound events
//!                                   └──────────────────────┘
//!                                          │ shares
//!                                          ▼
//!                                   Arc<Mutex<AckProcessor>>
//! ```
//!
//! Network I/O never runs on the actor itself. It is spawned, and the
//! result comes back as an event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidewire_encoding::{
    decode_message, decode_presence, encode_message, encode_presence, ChannelOptions,
    DecodeFailure, DecodingContext, EncodeOptions,
};
use tidewire_protocol::{
    codes, Action, AuthDetails, ErrorInfo, Format, Message, PresenceMessage, ProtocolError,
    ProtocolMessage,
};
use tidewire_transport::{Frame, Link, LinkId, Transport, TransportError, TransportState};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::ack::{self, AckProcessor, Completion, SharedAckProcessor};
use crate::auth::Credential;
use crate::config::{ClientOptions, DEFAULT_MAX_MESSAGE_SIZE};
use crate::connectivity::{ConnectivityProbe, HttpConnectivityProbe};
use crate::params::{connect_url, ConnectMode};
use crate::state::{
    Command, ConnectionInfo, ConnectionState, ConnectionStateChange, Event, SendDisposition,
    StateMachine,
};
use crate::timers::{TimerFired, Timers};
use crate::{transport_error_info, ConnectionError};

/// Counter for connection actor instances, used in their tracing span.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Capacity of the handle → actor command channel.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Capacity of each broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Something received on the connection that the application may care
/// about.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A channel-scoped frame (`Message`, `Presence`, `Sync`, `Attached`,
    /// `Detached` or a channel `Error`), with payloads already decoded.
    Message(ProtocolMessage),
    /// A frame that could not be parsed. The connection carries on.
    FrameRejected {
        /// Why parsing failed.
        reason: String,
    },
    /// A payload whose encoding could not be undone. The message is still
    /// delivered as part of [`InboundEvent::Message`], holding whatever was
    /// decoded and the remaining encoding.
    DecodeFailed {
        /// Channel the message arrived on.
        channel: String,
        /// Id of the message, if it had one.
        message_id: Option<String>,
        /// What failed.
        failure: Arc<DecodeFailure>,
    },
}

/// Commands sent from handles to the actor.
enum ManagerCommand {
    Connect,
    Close,
    Send {
        message: Box<ProtocolMessage>,
        completion: Completion,
    },
    Ping {
        reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
    },
    SetChannelOptions {
        channel: String,
        options: ChannelOptions,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a connection.
///
/// Cloning is cheap; every clone drives the same connection. The actor
/// stops when the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::Sender<ManagerCommand>,
    state: watch::Receiver<ConnectionState>,
    info: watch::Receiver<Option<ConnectionInfo>>,
    changes: broadcast::Sender<ConnectionStateChange>,
    inbound: broadcast::Sender<InboundEvent>,
    acks: SharedAckProcessor,
    request_timeout: Duration,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Starts a connection over `transport`, probing connectivity over HTTP.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns [`ConnectionError::InvalidOptions`] if no credentials are
    /// configured.
    pub fn new<T: Transport>(transport: T, options: ClientOptions) -> Result<Self, ConnectionError> {
        let probe = HttpConnectivityProbe::new(options.connectivity_check_url.clone());
        Self::with_probe(transport, probe, options)
    }

    /// Starts a connection with a custom connectivity probe.
    ///
    /// # Errors
    /// Returns [`ConnectionError::InvalidOptions`] if no credentials are
    /// configured or `recover` is malformed.
    pub fn with_probe<T, P>(transport: T, probe: P, options: ClientOptions) -> Result<Self, ConnectionError>
    where
        T: Transport,
        P: ConnectivityProbe,
    {
        let options = options.validated();
        if !options.auth.is_configured() {
            return Err(ConnectionError::InvalidOptions(
                "no key, token or token callback configured".into(),
            ));
        }
        let recover = options.recover_point();
        if options.recover.is_some() && recover.is_none() {
            return Err(ConnectionError::InvalidOptions(
                "recover must look like <connectionKey>:<connectionSerial>".into(),
            ));
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Initialized);
        let (info_tx, info_rx) = watch::channel(None);
        let (changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (inbound, _) = broadcast::channel(BROADCAST_CAPACITY);
        let acks: SharedAckProcessor = Arc::new(Mutex::new(AckProcessor::new()));
        let auto_connect = options.auto_connect;
        let request_timeout = options.realtime_request_timeout;

        let actor = ConnectionActor {
            transport: Arc::new(transport),
            probe: Arc::new(probe),
            machine: StateMachine::new(&options),
            timers: Timers::new(fired_tx),
            acks: acks.clone(),
            pending: VecDeque::new(),
            link: None,
            connecting: None,
            attempt: 0,
            connection: None,
            connection_serial: None,
            recover,
            token: None,
            channels: HashMap::new(),
            pings: HashMap::new(),
            commands: commands_rx,
            events_tx,
            events: events_rx,
            fired: fired_rx,
            state_tx,
            info_tx,
            changes: changes.clone(),
            inbound: inbound.clone(),
            options,
        };

        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("connection", instance);
        tokio::spawn(actor.run().instrument(span));

        let manager = Self {
            commands: commands_tx,
            state: state_rx,
            info: info_rx,
            changes,
            inbound,
            acks,
            request_timeout,
        };
        if auto_connect {
            manager
                .commands
                .try_send(ManagerCommand::Connect)
                .map_err(|_| ConnectionError::Shutdown)?;
        }
        Ok(manager)
    }

    async fn command(&self, cmd: ManagerCommand) -> Result<(), ConnectionError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| ConnectionError::Shutdown)
    }

    /// Starts connecting, if not already connecting or connected.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.command(ManagerCommand::Connect).await
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.command(ManagerCommand::Close).await
    }

    /// Hands a frame to the connection and returns a receiver for its
    /// outcome.
    ///
    /// Frames that need an acknowledgement resolve when the server acks or
    /// nacks them; others resolve once written. A frame that cannot be sent
    /// in the current state resolves with that state's error.
    pub async fn submit(
        &self,
        message: ProtocolMessage,
    ) -> Result<oneshot::Receiver<Result<(), ErrorInfo>>, ConnectionError> {
        let (completion, rx) = oneshot::channel();
        self.command(ManagerCommand::Send {
            message: Box::new(message),
            completion,
        })
        .await?;
        Ok(rx)
    }

    /// Sends a frame and waits for its outcome.
    ///
    /// # Errors
    /// [`ConnectionError::Rejected`] carries the server's (or the
    /// connection's) reason the frame was refused.
    pub async fn send(&self, message: ProtocolMessage) -> Result<(), ConnectionError> {
        let rx = self.submit(message).await?;
        rx.await
            .map_err(|_| ConnectionError::Shutdown)?
            .map_err(ConnectionError::Rejected)
    }

    /// Measures a heartbeat round trip.
    ///
    /// # Errors
    /// Fails if the connection is not `Connected` or the server does not
    /// answer within the request timeout.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.command(ManagerCommand::Ping { reply }).await?;
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(ConnectionError::Rejected),
            Ok(Err(_)) => Err(ConnectionError::Shutdown),
            Err(_) => Err(ConnectionError::Rejected(ErrorInfo::new(
                codes::TIMEOUT,
                Some(504),
                "no heartbeat reply within the request timeout",
            ))),
        }
    }

    /// Sets how payloads on `channel` are encoded and decoded.
    pub async fn set_channel_options(
        &self,
        channel: impl Into<String>,
        options: ChannelOptions,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.command(ManagerCommand::SetChannelOptions {
            channel: channel.into(),
            options,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ConnectionError::Shutdown)
    }

    /// The established connection, while it can be resumed.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.borrow().clone()
    }

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that always holds the current state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the connection is in `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ConnectionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ConnectionError::Shutdown)
    }

    /// Subscribes to state changes.
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.changes.subscribe()
    }

    /// Subscribes to inbound channel traffic.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inbound.subscribe()
    }

    /// Number of sent messages still waiting for an acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        ack::lock(&self.acks).len()
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Results of spawned work, fed back into the actor.
enum ActorEvent<L> {
    LinkOpened { attempt: u64, link: L },
    LinkFailed { attempt: u64, error: ConnectionError },
    Frame { link: LinkId, frame: Frame },
    LinkClosed { link: LinkId, error: Option<TransportError> },
    TokenRenewed(Result<String, ErrorInfo>),
    Connectivity(bool),
}

/// A frame for the writer task, with the completion to resolve once the
/// link has taken it.
type Outgoing = (Frame, Option<Completion>);

struct LinkSlot<L> {
    link: Arc<L>,
    writer: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelSlot {
    options: ChannelOptions,
    context: DecodingContext,
}

struct PendingPing {
    sent_at: Instant,
    reply: oneshot::Sender<Result<Duration, ErrorInfo>>,
}

struct ConnectionActor<T: Transport, P: ConnectivityProbe> {
    transport: Arc<T>,
    probe: Arc<P>,
    options: ClientOptions,
    machine: StateMachine,
    timers: Timers,
    acks: SharedAckProcessor,
    /// Messages waiting for the connection, in send order.
    pending: VecDeque<(ProtocolMessage, Completion)>,
    link: Option<LinkSlot<T::Link>>,
    connecting: Option<JoinHandle<()>>,
    /// Incremented per connect attempt; results of older attempts are
    /// discarded.
    attempt: u64,
    connection: Option<ConnectionInfo>,
    connection_serial: Option<i64>,
    recover: Option<(String, i64)>,
    /// Latest token from the token callback.
    token: Option<String>,
    channels: HashMap<String, ChannelSlot>,
    pings: HashMap<String, PendingPing>,
    commands: mpsc::Receiver<ManagerCommand>,
    events_tx: mpsc::UnboundedSender<ActorEvent<T::Link>>,
    events: mpsc::UnboundedReceiver<ActorEvent<T::Link>>,
    fired: mpsc::UnboundedReceiver<TimerFired>,
    state_tx: watch::Sender<ConnectionState>,
    info_tx: watch::Sender<Option<ConnectionInfo>>,
    changes: broadcast::Sender<ConnectionStateChange>,
    inbound: broadcast::Sender<InboundEvent>,
}

impl<T: Transport, P: ConnectivityProbe> ConnectionActor<T, P> {
    async fn run(mut self) {
        info!(host = self.machine.current_host(), format = %self.options.format, "connection actor started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(fired) = self.fired.recv() => {
                    if self.timers.take_if_current(fired) {
                        self.feed(Event::TimerFired(fired.kind));
                    }
                }
            }
        }
        self.shutdown();
        info!("connection actor stopped");
    }

    fn feed(&mut self, event: Event) {
        let commands = self.machine.handle(event, Instant::now());
        for command in commands {
            self.execute(command);
        }
    }

    // -- commands from handles -------------------------------------------------

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Connect => self.feed(Event::Connect),
            ManagerCommand::Close => self.feed(Event::Close),
            ManagerCommand::Send { message, completion } => self.handle_send(*message, completion),
            ManagerCommand::Ping { reply } => self.handle_ping(reply),
            ManagerCommand::SetChannelOptions {
                channel,
                options,
                reply,
            } => {
                debug!(%channel, encrypted = options.cipher.is_some(), "channel options set");
                self.channels.entry(channel).or_default().options = options;
                let _ = reply.send(());
            }
        }
    }

    fn handle_send(&mut self, mut message: ProtocolMessage, completion: Completion) {
        if let Err(error) = self.prepare(&mut message) {
            let error = error.to_error_info();
            debug!(code = error.code, "send refused");
            complete(completion, Err(error));
            return;
        }
        match self.machine.send_disposition(self.options.queue_messages) {
            SendDisposition::SendNow => self.send_now(message, completion),
            SendDisposition::Queue => {
                trace!(action = %message.action, queued = self.pending.len() + 1, "send queued until connected");
                self.pending.push_back((message, completion));
            }
            SendDisposition::Fail(error) => complete(completion, Err(error)),
        }
    }

    /// Checks client ids and size, and runs the payload encoder chain.
    fn prepare(&self, msg: &mut ProtocolMessage) -> Result<(), ConnectionError> {
        let expected = self
            .connection
            .as_ref()
            .and_then(|c| c.client_id.as_deref())
            .or(self.options.client_id.as_deref())
            .filter(|id| *id != "*");
        if let Some(expected) = expected {
            let conflicting = msg
                .messages
                .iter()
                .filter_map(|m| m.client_id.as_deref())
                .chain(msg.presence.iter().filter_map(|p| p.client_id.as_deref()))
                .find(|id| *id != expected);
            if let Some(found) = conflicting {
                return Err(ErrorInfo::new(
                    codes::INCOMPATIBLE_CLIENT_ID,
                    Some(400),
                    format!("client id {found:?} does not match the connection's {expected:?}"),
                )
                .into());
            }
        }

        if let Some(channel) = &msg.channel {
            let opts = EncodeOptions {
                format: self.options.format,
                cipher: self.channels.get(channel).and_then(|c| c.options.cipher.as_ref()),
            };
            for m in &mut msg.messages {
                encode_message(m, &opts)?;
            }
            for p in &mut msg.presence {
                encode_presence(p, &opts)?;
            }
        }

        let max = self
            .connection
            .as_ref()
            .and_then(|c| c.max_message_size)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);
        let size = frame_payload_size(msg);
        if (size as u64) > max {
            return Err(ErrorInfo::new(
                codes::MAX_MESSAGE_SIZE_EXCEEDED,
                Some(400),
                format!("message size {size} exceeds the maximum of {max} bytes"),
            )
            .into());
        }
        Ok(())
    }

    /// Writes a frame now. Frames that need an acknowledgement wait in the
    /// ack queue and are sent again on resume if this write fails; the
    /// others resolve with the outcome of the write.
    fn send_now(&mut self, mut message: ProtocolMessage, completion: Completion) {
        let immediate = ack::lock(&self.acks).queue_if_necessary(&mut message, completion);
        let _ = self.write(&message, immediate);
    }

    fn handle_ping(&mut self, reply: oneshot::Sender<Result<Duration, ErrorInfo>>) {
        if self.machine.state() != ConnectionState::Connected {
            let _ = reply.send(Err(self.machine.state().error()));
            return;
        }
        self.pings.retain(|_, ping| !ping.reply.is_closed());
        let id = format!("{:016x}", rand::random::<u64>());
        let mut msg = ProtocolMessage::new(Action::Heartbeat);
        msg.id = Some(id.clone());
        match self.write(&msg, None) {
            Ok(()) => {
                self.pings.insert(
                    id,
                    PendingPing {
                        sent_at: Instant::now(),
                        reply,
                    },
                );
            }
            Err(error) => {
                let _ = reply.send(Err(error.to_error_info()));
            }
        }
    }

    // -- events from spawned work --------------------------------------------------

    fn handle_event(&mut self, event: ActorEvent<T::Link>) {
        match event {
            ActorEvent::LinkOpened { attempt, link } => {
                if attempt != self.attempt || self.connecting.is_none() {
                    debug!(link = %link.id(), "link from an abandoned attempt closed");
                    tokio::spawn(
                        async move {
                            let _ = link.close().await;
                        }
                        .in_current_span(),
                    );
                    return;
                }
                self.connecting = None;
                self.install_link(link);
                self.feed(Event::TransportOpened);
            }
            ActorEvent::LinkFailed { attempt, error } => {
                if attempt != self.attempt {
                    return;
                }
                self.connecting = None;
                debug!(error = %error, "connect attempt failed");
                self.feed(Event::TransportFailed(error.to_error_info()));
            }
            ActorEvent::Frame { link, frame } => {
                if self.current_link_id() != Some(link) {
                    trace!(%link, "frame from a replaced link dropped");
                    return;
                }
                self.on_frame(frame);
            }
            ActorEvent::LinkClosed { link, error } => {
                if self.current_link_id() != Some(link) {
                    return;
                }
                let reason = match &error {
                    Some(e) => transport_error_info(e),
                    None => ErrorInfo::new(codes::DISCONNECTED, None, "connection closed by the server"),
                };
                info!(%link, reason = %reason.message, "link lost");
                self.destroy_link();
                self.feed(Event::TransportFailed(reason));
            }
            ActorEvent::TokenRenewed(Ok(token)) => {
                debug!("token renewed");
                self.token = Some(token);
                self.feed(Event::TokenRenewed);
            }
            ActorEvent::TokenRenewed(Err(error)) => {
                warn!(%error, "token renewal failed");
                self.feed(Event::TokenRenewalFailed(error));
            }
            ActorEvent::Connectivity(online) => self.feed(Event::ConnectivityChecked(online)),
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        let msg = match decode_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, bytes = frame.len(), "undecodable frame dropped");
                let _ = self.inbound.send(InboundEvent::FrameRejected {
                    reason: e.to_string(),
                });
                return;
            }
        };
        trace!(action = %msg.action, channel = ?msg.channel, "frame in");
        self.on_protocol_message(msg);
    }

    /// Fans one inbound frame out: state machine, then acks, then
    /// heartbeats, then channel listeners.
    fn on_protocol_message(&mut self, mut msg: ProtocolMessage) {
        if let Some(serial) = msg.connection_serial {
            self.connection_serial = Some(serial);
        }

        let link_state = self
            .link
            .as_ref()
            .map_or(TransportState::Closed, |slot| slot.link.state());
        self.feed(Event::Inbound {
            message: Box::new(msg.clone()),
            link_state,
        });

        ack::lock(&self.acks).on_message_received(&msg);

        if msg.action == Action::Heartbeat {
            if let Some(ping) = msg.id.as_ref().and_then(|id| self.pings.remove(id)) {
                let _ = ping.reply.send(Ok(ping.sent_at.elapsed()));
            }
        }
        self.feed(Event::Activity);

        if is_channel_frame(&msg) {
            self.decode_payloads(&mut msg);
            let _ = self.inbound.send(InboundEvent::Message(msg));
        }
    }

    fn decode_payloads(&mut self, msg: &mut ProtocolMessage) {
        let Some(channel) = msg.channel.clone() else {
            return;
        };
        let slot = self.channels.entry(channel.clone()).or_default();
        let cipher = slot.options.cipher.as_ref();

        for m in &mut msg.messages {
            if let Err(failure) = decode_message(m, cipher, &mut slot.context) {
                warn!(%channel, message_id = ?m.id, error = %failure, "message payload could not be decoded");
                let _ = self.inbound.send(InboundEvent::DecodeFailed {
                    channel: channel.clone(),
                    message_id: m.id.clone(),
                    failure: Arc::from(failure),
                });
            }
        }
        for p in &mut msg.presence {
            if let Err(failure) = decode_presence(p, cipher) {
                warn!(%channel, error = %failure, "presence payload could not be decoded");
                let _ = self.inbound.send(InboundEvent::DecodeFailed {
                    channel: channel.clone(),
                    message_id: p.id.clone(),
                    failure: Arc::from(failure),
                });
            }
        }
    }

    // -- state machine commands ------------------------------------------------

    fn execute(&mut self, command: Command) {
        match command {
            Command::OpenTransport { host } => self.open_transport(&host),
            Command::CloseTransport => {
                let _ = self.write(&ProtocolMessage::new(Action::Close), None);
            }
            Command::DestroyTransport => self.destroy_link(),
            Command::StartTimer { kind, after } => {
                if let Err(e) = self.timers.start(kind, after) {
                    error!(error = %e, "timer misuse");
                }
            }
            Command::CancelTimer(kind) => self.timers.cancel(kind),
            Command::AdoptConnection(info) => {
                let same_connection = self.connection.as_ref().is_some_and(|c| c.id == info.id);
                if !same_connection || info.serial.is_some() {
                    self.connection_serial = info.serial;
                }
                debug!(connection_id = %info.id, resumed = same_connection, "connection established");
                self.connection = Some(info.clone());
                self.info_tx.send_replace(Some(info));
            }
            Command::ResendAckQueue { new_epoch } => {
                let messages = ack::lock(&self.acks).messages_for_resend(new_epoch);
                if !messages.is_empty() {
                    debug!(count = messages.len(), new_epoch, "resending unacknowledged messages");
                }
                for msg in &messages {
                    let _ = self.write(msg, None);
                }
            }
            Command::FlushPending => {
                let pending = std::mem::take(&mut self.pending);
                if !pending.is_empty() {
                    debug!(count = pending.len(), "flushing queued messages");
                }
                for (msg, completion) in pending {
                    self.send_now(msg, completion);
                }
            }
            Command::FailQueues(error) => self.fail_queues(&error),
            Command::ClearConnection => {
                self.connection = None;
                self.connection_serial = None;
                self.info_tx.send_replace(None);
                for slot in self.channels.values_mut() {
                    slot.context.clear();
                }
            }
            Command::RenewToken => self.renew_token(),
            Command::SendAuth => match self.token.clone().or_else(|| self.options.auth.token.clone()) {
                Some(access_token) => {
                    let mut msg = ProtocolMessage::new(Action::Auth);
                    msg.auth = Some(AuthDetails { access_token });
                    let _ = self.write(&msg, None);
                }
                None => warn!("no token to send"),
            },
            Command::CheckConnectivity => {
                let probe = self.probe.clone();
                let events = self.events_tx.clone();
                let timeout = self.options.realtime_request_timeout;
                tokio::spawn(
                    async move {
                        let online = tokio::time::timeout(timeout, probe.check())
                            .await
                            .unwrap_or(false);
                        let _ = events.send(ActorEvent::Connectivity(online));
                    }
                    .in_current_span(),
                );
            }
            Command::Notify(change) => self.notify(change),
        }
    }

    fn open_transport(&mut self, host: &str) {
        self.destroy_link();
        self.attempt += 1;
        let attempt = self.attempt;
        let credential = Credential::select(&self.options.auth, self.token.as_deref());
        let mode = self.connect_mode();

        let url = match connect_url(&self.options, host, credential.as_ref(), &mode) {
            Ok(url) => url,
            Err(e) => {
                warn!(%host, error = %e, "cannot build connection url");
                let _ = self.events_tx.send(ActorEvent::LinkFailed {
                    attempt,
                    error: e.into(),
                });
                return;
            }
        };
        debug!(%host, attempt, mode = mode_name(&mode), "opening link");

        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let timeout = self.options.realtime_request_timeout;
        self.connecting = Some(tokio::spawn(
            async move {
                let event = match tokio::time::timeout(timeout, transport.connect(&url)).await {
                    Ok(Ok(link)) => ActorEvent::LinkOpened { attempt, link },
                    Ok(Err(error)) => ActorEvent::LinkFailed {
                        attempt,
                        error: error.into(),
                    },
                    Err(_) => ActorEvent::LinkFailed {
                        attempt,
                        error: TransportError::ConnectFailed {
                            status: None,
                            reason: "connect timed out".into(),
                        }
                        .into(),
                    },
                };
                let _ = events.send(event);
            }
            .in_current_span(),
        ));
    }

    /// Resume the lost connection if possible, otherwise recover from the
    /// `recover` option once, otherwise start fresh.
    fn connect_mode(&mut self) -> ConnectMode {
        if let Some(key) = self.connection.as_ref().and_then(|c| c.key.clone()) {
            return ConnectMode::Resume {
                key,
                serial: self.connection_serial,
            };
        }
        match self.recover.take() {
            Some((key, serial)) => ConnectMode::Recover { key, serial },
            None => ConnectMode::Clean,
        }
    }

    fn install_link(&mut self, link: T::Link) {
        let link = Arc::new(link);
        let id = link.id();
        debug!(%id, "link open");

        let reader_link = link.clone();
        let events = self.events_tx.clone();
        let reader = tokio::spawn(
            async move {
                loop {
                    match reader_link.recv().await {
                        Ok(Some(frame)) => {
                            if events.send(ActorEvent::Frame { link: id, frame }).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = events.send(ActorEvent::LinkClosed { link: id, error: None });
                            break;
                        }
                        Err(e) => {
                            let _ = events.send(ActorEvent::LinkClosed { link: id, error: Some(e) });
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let (writer, mut frames) = mpsc::unbounded_channel::<Outgoing>();
        let writer_link = link.clone();
        let events = self.events_tx.clone();
        let writer_task = tokio::spawn(
            async move {
                while let Some((frame, completion)) = frames.recv().await {
                    match writer_link.send(frame).await {
                        Ok(()) => {
                            if let Some(completion) = completion {
                                complete(completion, Ok(()));
                            }
                        }
                        Err(e) => {
                            let info = transport_error_info(&e);
                            debug!(error = %e, "link write failed");
                            // Everything still queued for this link fails
                            // the same way.
                            frames.close();
                            let unsent = std::iter::once(completion)
                                .chain(std::iter::from_fn(|| frames.try_recv().ok().map(|(_, c)| c)));
                            for completion in unsent.flatten() {
                                complete(completion, Err(info.clone()));
                            }
                            let _ = events.send(ActorEvent::LinkClosed { link: id, error: Some(e) });
                            break;
                        }
                    }
                }
            }
            .in_current_span(),
        );

        self.link = Some(LinkSlot {
            link,
            writer,
            reader,
            writer_task,
        });
    }

    fn current_link_id(&self) -> Option<LinkId> {
        self.link.as_ref().map(|slot| slot.link.id())
    }

    /// Drops the current link and any attempt in flight. Idempotent.
    fn destroy_link(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        let Some(slot) = self.link.take() else {
            return;
        };
        debug!(link = %slot.link.id(), "destroying link");
        slot.reader.abort();
        // Closing the writer channel lets already queued frames (a Close)
        // go out before the link is closed.
        drop(slot.writer);
        let link = slot.link;
        let writer_task = slot.writer_task;
        let timeout = self.options.realtime_request_timeout;
        tokio::spawn(
            async move {
                let _ = tokio::time::timeout(timeout, writer_task).await;
                if let Err(e) = link.close().await {
                    debug!(error = %e, "link close failed");
                }
            }
            .in_current_span(),
        );
    }

    /// Hands a frame to the current link's writer.
    ///
    /// `completion`, if any, resolves once the link has taken the frame, or
    /// with the reason it never will.
    fn write(
        &self,
        msg: &ProtocolMessage,
        completion: Option<Completion>,
    ) -> Result<(), ConnectionError> {
        let result: Result<(), (ConnectionError, Option<Completion>)> = match &self.link {
            None => Err((ConnectionError::Rejected(self.machine.state().error()), completion)),
            Some(slot) => match encode_frame(self.options.format, msg) {
                Err(e) => {
                    warn!(action = %msg.action, error = %e, "frame could not be encoded");
                    Err((e.into(), completion))
                }
                Ok(frame) => {
                    trace!(action = %msg.action, msg_serial = ?msg.msg_serial, bytes = frame.len(), "frame out");
                    slot.writer
                        .send((frame, completion))
                        .map_err(|mpsc::error::SendError((_, completion))| {
                            let stopped = TransportError::ConnectionClosed("link writer stopped".into());
                            (stopped.into(), completion)
                        })
                }
            },
        };
        result.map_err(|(error, completion)| {
            debug!(action = %msg.action, %error, "frame not sent");
            if let Some(completion) = completion {
                complete(completion, Err(error.to_error_info()));
            }
            error
        })
    }

    fn renew_token(&mut self) {
        let events = self.events_tx.clone();
        let Some(callback) = self.options.auth.token_callback.clone() else {
            let _ = events.send(ActorEvent::TokenRenewed(Err(ErrorInfo::new(
                codes::TOKEN_NOT_RENEWABLE,
                Some(403),
                "no token callback configured",
            ))));
            return;
        };
        let timeout = self.options.realtime_request_timeout;
        debug!("requesting a new token");
        tokio::spawn(
            async move {
                let result = tokio::time::timeout(timeout, callback())
                    .await
                    .unwrap_or_else(|_| {
                        Err(ErrorInfo::new(codes::TIMEOUT, Some(504), "token request timed out"))
                    });
                let _ = events.send(ActorEvent::TokenRenewed(result));
            }
            .in_current_span(),
        );
    }

    fn fail_queues(&mut self, error: &ErrorInfo) {
        for (_, completion) in self.pending.drain(..) {
            complete(completion, Err(error.clone()));
        }
        ack::lock(&self.acks).clear_queue_and_fail_messages(error);
        self.fail_pings(error);
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(error.clone()));
        }
    }

    fn notify(&mut self, change: ConnectionStateChange) {
        match &change.reason {
            Some(reason) => info!(
                previous = %change.previous,
                current = %change.current,
                code = reason.code,
                reason = %reason.message,
                retry_in = ?change.retry_in,
                "connection state changed"
            ),
            None => info!(
                previous = %change.previous,
                current = %change.current,
                retry_in = ?change.retry_in,
                "connection state changed"
            ),
        }
        if change.current != ConnectionState::Connected {
            self.fail_pings(&change.current.error());
        }
        self.state_tx.send_replace(change.current);
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.destroy_link();
        self.fail_queues(&ErrorInfo::new(
            codes::CONNECTION_CLOSED,
            None,
            "connection manager dropped",
        ));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn complete(completion: Completion, result: Result<(), ErrorInfo>) {
    if completion.send(result).is_err() {
        warn!("completion receiver dropped");
    }
}

fn mode_name(mode: &ConnectMode) -> &'static str {
    match mode {
        ConnectMode::Clean => "clean",
        ConnectMode::Resume { .. } => "resume",
        ConnectMode::Recover { .. } => "recover",
    }
}

/// Payload bytes counted against the server's message size limit.
fn frame_payload_size(msg: &ProtocolMessage) -> usize {
    let messages: usize = msg.messages.iter().map(Message::size).sum();
    let presence: usize = msg.presence.iter().map(PresenceMessage::size).sum();
    messages + presence
}

/// Frames that belong to a channel and are handed to listeners.
fn is_channel_frame(msg: &ProtocolMessage) -> bool {
    msg.channel.is_some()
        && matches!(
            msg.action,
            Action::Message
                | Action::Presence
                | Action::Sync
                | Action::Attached
                | Action::Detached
                | Action::Error
        )
}

/// Serializes a frame in the configured format: JSON as text, MsgPack as
/// binary.
pub fn encode_frame(format: Format, msg: &ProtocolMessage) -> Result<Frame, ProtocolError> {
    let bytes = format.serialize(msg)?;
    if format.is_binary() {
        Ok(Frame::Binary(bytes))
    } else {
        String::from_utf8(bytes)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}

/// Parses a frame, whichever format it arrived in.
pub fn decode_frame(frame: &Frame) -> Result<ProtocolMessage, ProtocolError> {
    match frame {
        Frame::Text(text) => Format::Json.deserialize(text.as_bytes()),
        Frame::Binary(bytes) => Format::MsgPack.deserialize(bytes),
    }
}
