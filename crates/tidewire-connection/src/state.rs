//! The connection state machine.
//!
//! [`StateMachine::handle`] takes one [`Event`] and returns the
//! [`Command`]s the manager must carry out. The machine itself performs no
//! I/O and reads no clock; `now` is passed in.
//!
//! ```text
//!                 connect()
//!  Initialized ───────────────▶ Connecting ──Connected──▶ Connected
//!                                │  ▲    ▲                  │
//!                  failure / TTL │  │    │ retry timer      │ link lost
//!                                ▼  │    │                  ▼
//!                 Suspended ◀── (TTL) ── Disconnected ◀─────┘
//!
//!  close(): Connecting / Connected ─▶ Closing ─▶ Closed
//!           Disconnected / Suspended ──────────▶ Closed
//!  fatal error, from anywhere live ───────────▶ Failed
//! ```

use std::fmt;
use std::time::Duration;

use tidewire_protocol::{codes, Action, ErrorInfo, ProtocolMessage};
use tidewire_transport::TransportState;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::retry::{is_fallback_eligible, retry_delay, ConnectionAttempts, HostSelector};
use crate::timers::TimerKind;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Created, never connected.
    #[default]
    Initialized,
    /// An attempt is in progress.
    Connecting,
    /// Live; messages flow.
    Connected,
    /// Lost; retrying soon, and the connection can still be resumed.
    Disconnected,
    /// Lost for longer than the server keeps state; retrying slowly.
    Suspended,
    /// Waiting for the server to confirm a close.
    Closing,
    /// Closed on request.
    Closed,
    /// Stopped by an unrecoverable error.
    Failed,
}

impl ConnectionState {
    /// The timer owned by this state, cancelled when the state is left.
    fn timer(self) -> Option<TimerKind> {
        match self {
            Self::Connecting => Some(TimerKind::Connect),
            Self::Connected => Some(TimerKind::Idle),
            Self::Disconnected => Some(TimerKind::DisconnectedRetry),
            Self::Suspended => Some(TimerKind::SuspendedRetry),
            Self::Closing => Some(TimerKind::Close),
            Self::Initialized | Self::Closed | Self::Failed => None,
        }
    }

    /// The error a send fails with in this state.
    pub fn error(self) -> ErrorInfo {
        match self {
            Self::Initialized | Self::Connecting | Self::Disconnected | Self::Connected => {
                ErrorInfo::new(codes::DISCONNECTED, None, format!("connection is {self}"))
            }
            Self::Suspended => {
                ErrorInfo::new(codes::CONNECTION_SUSPENDED, None, "connection is suspended")
            }
            Self::Closing | Self::Closed => {
                ErrorInfo::new(codes::CONNECTION_CLOSED, None, format!("connection is {self}"))
            }
            Self::Failed => ErrorInfo::new(codes::CONNECTION_FAILED, None, "connection failed"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Suspended => "suspended",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A state transition, as published to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after it.
    pub current: ConnectionState,
    /// Why, when the transition was caused by an error.
    pub reason: Option<ErrorInfo>,
    /// When the next attempt is due, for `Disconnected` and `Suspended`.
    pub retry_in: Option<Duration>,
}

/// Snapshot of an established connection, taken from its `Connected` frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    /// Connection id. A different id after a reconnect means the server
    /// started a new connection instead of resuming.
    pub id: String,
    /// Key used to resume.
    pub key: Option<String>,
    /// Last connection serial seen.
    pub serial: Option<i64>,
    /// Client id the server assigned or confirmed.
    pub client_id: Option<String>,
    /// How long the server keeps this connection's state.
    pub connection_state_ttl: Option<Duration>,
    /// Longest expected silence from the server.
    pub max_idle_interval: Option<Duration>,
    /// Largest accepted message.
    pub max_message_size: Option<u64>,
    /// Server the connection landed on.
    pub server_id: Option<String>,
}

impl ConnectionInfo {
    /// Builds the snapshot from a `Connected` frame.
    pub fn from_connected(msg: &ProtocolMessage) -> Self {
        let details = msg.connection_details.clone().unwrap_or_default();
        Self {
            id: msg.connection_id.clone().unwrap_or_default(),
            key: details.connection_key.or_else(|| msg.connection_key.clone()),
            serial: msg.connection_serial,
            client_id: details.client_id,
            connection_state_ttl: details.connection_state_ttl.map(Duration::from_millis),
            max_idle_interval: details.max_idle_interval.map(Duration::from_millis),
            max_message_size: details.max_message_size,
            server_id: details.server_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Events and commands
// ---------------------------------------------------------------------------

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The application asked to connect.
    Connect,
    /// The application asked to close.
    Close,
    /// The link requested by [`Command::OpenTransport`] is open.
    TransportOpened,
    /// A frame arrived on the current link, which reported `link_state`.
    Inbound {
        message: Box<ProtocolMessage>,
        link_state: TransportState,
    },
    /// The link could not be opened, or the open link was lost.
    TransportFailed(ErrorInfo),
    /// A timer started by [`Command::StartTimer`] expired.
    TimerFired(TimerKind),
    /// The server sent something, so it is alive.
    Activity,
    /// [`Command::RenewToken`] produced a token.
    TokenRenewed,
    /// [`Command::RenewToken`] failed.
    TokenRenewalFailed(ErrorInfo),
    /// [`Command::CheckConnectivity`] finished.
    ConnectivityChecked(bool),
}

/// Work the manager carries out on the machine's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open a link to `host`.
    OpenTransport { host: String },
    /// Send a `Close` frame on the current link.
    CloseTransport,
    /// Drop the current link (or the attempt to open one).
    DestroyTransport,
    /// Start a timer.
    StartTimer { kind: TimerKind, after: Duration },
    /// Cancel a timer.
    CancelTimer(TimerKind),
    /// Take on the identity of an established connection.
    AdoptConnection(ConnectionInfo),
    /// Send every unacknowledged message again.
    ResendAckQueue { new_epoch: bool },
    /// Send everything queued while not connected.
    FlushPending,
    /// Fail every queued and unacknowledged message.
    FailQueues(ErrorInfo),
    /// Forget the connection's identity; it can no longer be resumed.
    ClearConnection,
    /// Ask the token callback for a new token.
    RenewToken,
    /// Send an `Auth` frame with the current token.
    SendAuth,
    /// Ask the connectivity probe whether the network is up.
    CheckConnectivity,
    /// Tell listeners about a state change.
    Notify(ConnectionStateChange),
}

/// What to do with a message the application wants to send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendDisposition {
    /// Write it to the link now.
    SendNow,
    /// Hold it until the connection is up.
    Queue,
    /// Refuse it.
    Fail(ErrorInfo),
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// What the machine is waiting on while `Connecting` (or, for a
/// server-requested reauth, `Connected`).
#[derive(Debug, Clone, PartialEq)]
enum Awaiting {
    Nothing,
    TokenForConnect,
    TokenForAuth,
    Connectivity(ErrorInfo),
}

/// The connection state machine.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    disconnected_retry_timeout: Duration,
    suspended_retry_timeout: Duration,
    request_timeout: Duration,
    close_timeout: Duration,
    connection_state_ttl: Duration,
    can_renew_token: bool,
    needs_token: bool,
    hosts: HostSelector,
    attempts: ConnectionAttempts,
    connection: Option<ConnectionInfo>,
    idle_interval: Option<Duration>,
    transport_open: bool,
    renewal_attempted: bool,
    awaiting: Awaiting,
    error_reason: Option<ErrorInfo>,
}

impl StateMachine {
    /// Creates a machine in `Initialized`.
    pub fn new(options: &ClientOptions) -> Self {
        let auth = &options.auth;
        Self {
            state: ConnectionState::Initialized,
            disconnected_retry_timeout: options.disconnected_retry_timeout,
            suspended_retry_timeout: options.suspended_retry_timeout,
            request_timeout: options.realtime_request_timeout,
            close_timeout: options.close_timeout,
            connection_state_ttl: options.connection_state_ttl,
            can_renew_token: auth.can_renew(),
            needs_token: auth.key.is_none() && auth.token.is_none() && auth.can_renew(),
            hosts: HostSelector::new(options.primary_host(), options.resolved_fallback_hosts()),
            attempts: ConnectionAttempts::default(),
            connection: None,
            idle_interval: None,
            transport_open: false,
            renewal_attempted: false,
            awaiting: Awaiting::Nothing,
            error_reason: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The established connection, while it can still be resumed.
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    /// The error behind the current state, if any.
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// The current attempt run.
    pub fn attempts(&self) -> &ConnectionAttempts {
        &self.attempts
    }

    /// The host the current (or next) attempt goes to.
    pub fn current_host(&self) -> &str {
        self.hosts.current()
    }

    /// How long the server keeps connection state.
    pub fn connection_state_ttl(&self) -> Duration {
        self.connection_state_ttl
    }

    /// How a message sent now should be handled.
    pub fn send_disposition(&self, queue_messages: bool) -> SendDisposition {
        match self.state {
            ConnectionState::Connected => SendDisposition::SendNow,
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected
                if queue_messages =>
            {
                SendDisposition::Queue
            }
            ConnectionState::Failed => SendDisposition::Fail(
                self.error_reason
                    .clone()
                    .unwrap_or_else(|| self.state.error()),
            ),
            state => SendDisposition::Fail(state.error()),
        }
    }

    /// Applies `event` and returns the commands it calls for, in order.
    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Command> {
        let mut out = Vec::new();
        match event {
            Event::Connect => self.on_connect(now, &mut out),
            Event::Close => self.on_close(&mut out),
            Event::TransportOpened => {
                if self.state == ConnectionState::Connecting {
                    self.transport_open = true;
                }
            }
            Event::Inbound { message, link_state } => {
                self.on_inbound(*message, link_state, now, &mut out);
            }
            Event::TransportFailed(error) => self.on_transport_failed(error, now, &mut out),
            Event::TimerFired(kind) => self.on_timer(kind, now, &mut out),
            Event::Activity => self.on_activity(&mut out),
            Event::TokenRenewed => self.on_token_renewed(&mut out),
            Event::TokenRenewalFailed(error) => self.on_token_renewal_failed(error, &mut out),
            Event::ConnectivityChecked(online) => self.on_connectivity(online, now, &mut out),
        }
        out
    }

    // -- event handlers ------------------------------------------------------

    fn on_connect(&mut self, now: Instant, out: &mut Vec<Command>) {
        match self.state {
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended
            | ConnectionState::Closed
            | ConnectionState::Failed => self.enter_connecting(now, out),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closing => {}
        }
    }

    fn on_close(&mut self, out: &mut Vec<Command>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => self.enter_closing(out),
            ConnectionState::Disconnected | ConnectionState::Suspended => {
                self.enter_closed(None, out);
            }
            ConnectionState::Initialized
            | ConnectionState::Closing
            | ConnectionState::Closed
            | ConnectionState::Failed => {}
        }
    }

    fn on_inbound(
        &mut self,
        msg: ProtocolMessage,
        link_state: TransportState,
        now: Instant,
        out: &mut Vec<Command>,
    ) {
        use ConnectionState as S;

        match (self.state, msg.action) {
            (S::Connecting | S::Connected, Action::Connected)
                if link_state != TransportState::Connected =>
            {
                debug!(%link_state, "Connected frame on a link that is not open ignored");
            }
            (S::Connecting, Action::Connected) => {
                let info = ConnectionInfo::from_connected(&msg);
                self.enter_connected(info, msg.error, out);
            }
            (S::Connected, Action::Connected) => {
                let info = ConnectionInfo::from_connected(&msg);
                self.connection = Some(info.clone());
                out.push(Command::AdoptConnection(info));
            }
            (S::Connecting | S::Connected | S::Closing, Action::Error) if msg.channel.is_none() => {
                let error = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::UNKNOWN_CONNECTION_ERROR, Some(500), "connection error")
                });
                self.on_connection_error(error, now, out);
            }
            (S::Connecting | S::Connected | S::Closing, Action::Disconnected) => {
                let error = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(codes::DISCONNECTED, None, "disconnected by the server")
                });
                match self.state {
                    S::Closing => self.enter_disconnected(Some(error), out),
                    _ if error.is_token_error() => self.on_token_error(error, now, out),
                    S::Connecting => self.on_attempt_failed(error, now, out),
                    _ => self.enter_disconnected(Some(error), out),
                }
            }
            (S::Connected, Action::Close | Action::Closed) | (S::Closing, Action::Closed) => {
                self.enter_closed(msg.error, out);
            }
            (S::Connected, Action::Auth) => {
                if self.can_renew_token {
                    debug!("server requested reauthentication");
                    self.awaiting = Awaiting::TokenForAuth;
                    out.push(Command::RenewToken);
                } else {
                    warn!("server requested reauthentication but the token cannot be renewed");
                }
            }
            _ => {}
        }
    }

    fn on_connection_error(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Command>) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected if error.is_token_error() => {
                self.on_token_error(error, now, out);
            }
            ConnectionState::Connecting if error.is_retriable() => {
                self.on_attempt_failed(error, now, out);
            }
            _ => self.enter_failed(error, out),
        }
    }

    fn on_token_error(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Command>) {
        if !self.can_renew_token {
            let reason = ErrorInfo::new(
                codes::TOKEN_NOT_RENEWABLE,
                Some(403),
                format!("token rejected and no way to renew it: {}", error.message),
            );
            self.enter_failed(reason, out);
            return;
        }
        if self.renewal_attempted {
            self.enter_failed(error, out);
            return;
        }
        self.renewal_attempted = true;

        if self.state == ConnectionState::Connected {
            let previous = self.state;
            self.leave(out);
            self.state = ConnectionState::Connecting;
            self.attempts.start(now);
            self.notify(previous, Some(error), None, out);
        } else {
            out.push(Command::CancelTimer(TimerKind::Connect));
        }
        self.destroy(out);
        self.awaiting = Awaiting::TokenForConnect;
        out.push(Command::RenewToken);
    }

    fn on_transport_failed(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Command>) {
        match self.state {
            ConnectionState::Connecting if self.awaiting != Awaiting::Nothing => {
                debug!("transport failure while waiting on a request ignored");
            }
            ConnectionState::Connecting if !error.is_retriable() => self.enter_failed(error, out),
            ConnectionState::Connecting => self.on_attempt_failed(error, now, out),
            ConnectionState::Connected => self.enter_disconnected(Some(error), out),
            ConnectionState::Closing => self.enter_closed(None, out),
            _ => {}
        }
    }

    fn on_timer(&mut self, kind: TimerKind, now: Instant, out: &mut Vec<Command>) {
        match (self.state, kind) {
            (ConnectionState::Connecting, TimerKind::Connect) => {
                let error = ErrorInfo::new(
                    codes::CONNECTION_TIMED_OUT,
                    None,
                    "connection attempt timed out",
                );
                self.on_attempt_failed(error, now, out);
            }
            (ConnectionState::Connected, TimerKind::Idle) => {
                let error = ErrorInfo::new(
                    codes::DISCONNECTED,
                    None,
                    "no activity from the server within the idle interval",
                );
                self.enter_disconnected(Some(error), out);
            }
            (ConnectionState::Disconnected, TimerKind::DisconnectedRetry)
            | (ConnectionState::Suspended, TimerKind::SuspendedRetry) => {
                self.enter_connecting(now, out);
            }
            (ConnectionState::Closing, TimerKind::Close) => self.enter_closed(None, out),
            (state, kind) => debug!(%state, timer = %kind, "timer no longer applies"),
        }
    }

    fn on_activity(&mut self, out: &mut Vec<Command>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(interval) = self.idle_interval {
            out.push(Command::CancelTimer(TimerKind::Idle));
            out.push(Command::StartTimer {
                kind: TimerKind::Idle,
                after: interval,
            });
        }
    }

    fn on_token_renewed(&mut self, out: &mut Vec<Command>) {
        match (self.state, self.awaiting.clone()) {
            (ConnectionState::Connecting, Awaiting::TokenForConnect) => {
                self.awaiting = Awaiting::Nothing;
                self.needs_token = false;
                self.open(out);
            }
            (ConnectionState::Connected, Awaiting::TokenForAuth) => {
                self.awaiting = Awaiting::Nothing;
                out.push(Command::SendAuth);
            }
            _ => debug!(state = %self.state, "token renewal no longer needed"),
        }
    }

    fn on_token_renewal_failed(&mut self, error: ErrorInfo, out: &mut Vec<Command>) {
        match (self.state, self.awaiting.clone()) {
            (ConnectionState::Connecting, Awaiting::TokenForConnect) => self.enter_failed(error, out),
            (ConnectionState::Connected, Awaiting::TokenForAuth) => {
                self.awaiting = Awaiting::Nothing;
                if error.is_retriable() {
                    warn!(%error, "reauthentication failed, keeping the current token");
                } else {
                    self.enter_failed(error, out);
                }
            }
            _ => debug!(state = %self.state, "token renewal failure no longer relevant"),
        }
    }

    fn on_connectivity(&mut self, online: bool, now: Instant, out: &mut Vec<Command>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        if !matches!(self.awaiting, Awaiting::Connectivity(_)) {
            return;
        }
        let Awaiting::Connectivity(error) = std::mem::replace(&mut self.awaiting, Awaiting::Nothing)
        else {
            return;
        };
        if online && self.hosts.next_fallback().is_some() {
            debug!(host = self.hosts.current(), "trying fallback host");
            self.open(out);
        } else {
            if !online {
                debug!("network unreachable, not trying fallback hosts");
            }
            self.retry_later(error, now, out);
        }
    }

    /// A connection attempt failed in a recoverable way.
    fn on_attempt_failed(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Command>) {
        self.destroy(out);
        out.push(Command::CancelTimer(TimerKind::Connect));
        self.attempts.record(now, self.hosts.current(), error.clone());

        if is_fallback_eligible(&error) {
            if self.hosts.fallback_enabled() {
                if self.hosts.has_remaining() {
                    self.awaiting = Awaiting::Connectivity(error);
                    out.push(Command::CheckConnectivity);
                    return;
                }
            } else if error.is_server_error() {
                self.enter_failed(error, out);
                return;
            }
        }
        self.retry_later(error, now, out);
    }

    fn retry_later(&mut self, error: ErrorInfo, now: Instant, out: &mut Vec<Command>) {
        if self.attempts.should_suspend(now, self.connection_state_ttl) {
            self.enter_suspended(error, out);
        } else {
            self.enter_disconnected(Some(error), out);
        }
    }

    // -- state entry -----------------------------------------------------------

    fn leave(&mut self, out: &mut Vec<Command>) {
        if let Some(kind) = self.state.timer() {
            out.push(Command::CancelTimer(kind));
        }
        self.awaiting = Awaiting::Nothing;
    }

    fn notify(
        &self,
        previous: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
        out: &mut Vec<Command>,
    ) {
        out.push(Command::Notify(ConnectionStateChange {
            previous,
            current: self.state,
            reason,
            retry_in,
        }));
    }

    fn destroy(&mut self, out: &mut Vec<Command>) {
        self.transport_open = false;
        out.push(Command::DestroyTransport);
    }

    fn clear_connection(&mut self, out: &mut Vec<Command>) {
        self.connection = None;
        self.idle_interval = None;
        out.push(Command::ClearConnection);
    }

    /// Opens a link to the current host, fetching a first token if needed.
    fn open(&mut self, out: &mut Vec<Command>) {
        if self.needs_token {
            self.awaiting = Awaiting::TokenForConnect;
            out.push(Command::RenewToken);
            return;
        }
        self.transport_open = false;
        out.push(Command::CancelTimer(TimerKind::Connect));
        out.push(Command::OpenTransport {
            host: self.hosts.current().to_string(),
        });
        out.push(Command::StartTimer {
            kind: TimerKind::Connect,
            after: self.request_timeout,
        });
    }

    fn enter_connecting(&mut self, now: Instant, out: &mut Vec<Command>) {
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Connecting;
        if self.attempts.first_attempt().is_none() {
            self.hosts.reset();
        } else {
            self.hosts.rewind();
        }
        self.attempts.start(now);
        if matches!(previous, ConnectionState::Closed | ConnectionState::Failed) {
            self.error_reason = None;
            self.renewal_attempted = false;
        }
        self.notify(previous, None, None, out);
        self.open(out);
    }

    fn enter_connected(
        &mut self,
        info: ConnectionInfo,
        reason: Option<ErrorInfo>,
        out: &mut Vec<Command>,
    ) {
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Connected;

        let new_epoch = self.connection.as_ref().is_none_or(|c| c.id != info.id);
        if let Some(ttl) = info.connection_state_ttl {
            self.connection_state_ttl = ttl;
        }
        self.idle_interval = info.max_idle_interval.map(|i| i + self.request_timeout);
        self.connection = Some(info.clone());
        self.attempts.clear();
        self.renewal_attempted = false;
        self.transport_open = true;
        self.error_reason = reason.clone();

        out.push(Command::AdoptConnection(info));
        self.notify(previous, reason, None, out);
        out.push(Command::ResendAckQueue { new_epoch });
        out.push(Command::FlushPending);
        if let Some(interval) = self.idle_interval {
            out.push(Command::StartTimer {
                kind: TimerKind::Idle,
                after: interval,
            });
        }
    }

    fn enter_disconnected(&mut self, reason: Option<ErrorInfo>, out: &mut Vec<Command>) {
        let previous = self.state;
        let resumable = previous == ConnectionState::Connected
            && self.connection.as_ref().is_some_and(|c| c.key.is_some());
        self.leave(out);
        self.state = ConnectionState::Disconnected;
        self.destroy(out);

        let retry_in = if resumable {
            Duration::ZERO
        } else {
            let attempt = u32::try_from(self.attempts.failure_count()).unwrap_or(u32::MAX);
            retry_delay(self.disconnected_retry_timeout, attempt)
        };
        out.push(Command::StartTimer {
            kind: TimerKind::DisconnectedRetry,
            after: retry_in,
        });
        self.error_reason = reason.clone();
        self.notify(previous, reason, Some(retry_in), out);
    }

    fn enter_suspended(&mut self, reason: ErrorInfo, out: &mut Vec<Command>) {
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Suspended;
        self.destroy(out);
        out.push(Command::FailQueues(self.state.error()));
        self.clear_connection(out);
        out.push(Command::StartTimer {
            kind: TimerKind::SuspendedRetry,
            after: self.suspended_retry_timeout,
        });
        self.error_reason = Some(reason.clone());
        self.notify(previous, Some(reason), Some(self.suspended_retry_timeout), out);
    }

    fn enter_closing(&mut self, out: &mut Vec<Command>) {
        if !self.transport_open {
            self.enter_closed(None, out);
            return;
        }
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Closing;
        out.push(Command::CloseTransport);
        out.push(Command::StartTimer {
            kind: TimerKind::Close,
            after: self.close_timeout,
        });
        self.notify(previous, None, None, out);
    }

    fn enter_closed(&mut self, reason: Option<ErrorInfo>, out: &mut Vec<Command>) {
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Closed;
        self.destroy(out);
        self.clear_connection(out);
        out.push(Command::FailQueues(self.state.error()));
        self.attempts.clear();
        self.error_reason = reason.clone();
        self.notify(previous, reason, None, out);
    }

    fn enter_failed(&mut self, reason: ErrorInfo, out: &mut Vec<Command>) {
        let previous = self.state;
        self.leave(out);
        self.state = ConnectionState::Failed;
        self.destroy(out);
        out.push(Command::FailQueues(reason.clone()));
        self.clear_connection(out);
        self.attempts.clear();
        self.error_reason = Some(reason.clone());
        self.notify(previous, Some(reason), None, out);
    }
}

// =========================================================================
// Tests
// =========================================================================
