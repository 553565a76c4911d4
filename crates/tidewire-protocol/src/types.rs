//! Core protocol types for tidewire's wire format.
//!
//! Every frame exchanged with the service is one [`ProtocolMessage`]. Its
//! `action` says what the frame is for; the other fields are populated
//! depending on the action (a `Connected` frame carries connection details,
//! a `Message` frame carries messages, an `Ack` carries a serial range).
//!
//! Field names are camelCase on the wire, optional fields are omitted when
//! absent, and unknown fields are ignored when decoding, so newer servers can
//! add fields without breaking older clients.

use std::fmt;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ErrorInfo, Message, PresenceMessage};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The purpose of a protocol frame.
///
/// Serialized as a small integer, not a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    /// Keep-alive; also the reply to a ping.
    #[default]
    Heartbeat,
    /// The server accepted a range of published messages.
    Ack,
    /// The server rejected a range of published messages.
    Nack,
    /// Client → server connection request (unused on WebSocket transports,
    /// where the request is the transport URL).
    Connect,
    /// The connection is established.
    Connected,
    /// Client → server: "I'm going away, but may resume".
    Disconnect,
    /// The server dropped the connection; the client may resume.
    Disconnected,
    /// Client → server: "close this connection for good".
    Close,
    /// The server closed the connection.
    Closed,
    /// A connection-level or channel-level error.
    Error,
    /// Attach to a channel.
    Attach,
    /// The channel is attached.
    Attached,
    /// Detach from a channel.
    Detach,
    /// The channel is detached.
    Detached,
    /// Presence events.
    Presence,
    /// Channel messages.
    Message,
    /// Presence set synchronisation.
    Sync,
    /// Server asks for fresh credentials, or client supplies them.
    Auth,
}

impl Action {
    /// The numeric wire value.
    pub fn code(self) -> u8 {
        match self {
            Self::Heartbeat => 0,
            Self::Ack => 1,
            Self::Nack => 2,
            Self::Connect => 3,
            Self::Connected => 4,
            Self::Disconnect => 5,
            Self::Disconnected => 6,
            Self::Close => 7,
            Self::Closed => 8,
            Self::Error => 9,
            Self::Attach => 10,
            Self::Attached => 11,
            Self::Detach => 12,
            Self::Detached => 13,
            Self::Presence => 14,
            Self::Message => 15,
            Self::Sync => 16,
            Self::Auth => 17,
        }
    }

    /// Parses a numeric wire value. Returns `None` for unknown actions.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Heartbeat,
            1 => Self::Ack,
            2 => Self::Nack,
            3 => Self::Connect,
            4 => Self::Connected,
            5 => Self::Disconnect,
            6 => Self::Disconnected,
            7 => Self::Close,
            8 => Self::Closed,
            9 => Self::Error,
            10 => Self::Attach,
            11 => Self::Attached,
            12 => Self::Detach,
            13 => Self::Detached,
            14 => Self::Presence,
            15 => Self::Message,
            16 => Self::Sync,
            17 => Self::Auth,
            _ => return None,
        })
    }

    /// Frames with these actions are acknowledged by the server.
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::Message | Self::Presence)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heartbeat => "heartbeat",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::Disconnect => "disconnect",
            Self::Disconnected => "disconnected",
            Self::Close => "close",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Attach => "attach",
            Self::Attached => "attached",
            Self::Detach => "detach",
            Self::Detached => "detached",
            Self::Presence => "presence",
            Self::Message => "message",
            Self::Sync => "sync",
            Self::Auth => "auth",
        };
        f.write_str(name)
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown action {code}")))
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Bitset of frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(pub u64);

impl Flags {
    /// The channel has members present (on `Attached`).
    pub const HAS_PRESENCE: u64 = 1 << 0;
    /// The channel has a message backlog to deliver (on `Attached`).
    pub const HAS_BACKLOG: u64 = 1 << 1;
    /// The attachment or connection was resumed.
    pub const RESUMED: u64 = 1 << 2;

    /// Whether every bit of `flag` is set.
    pub fn contains(self, flag: u64) -> bool {
        self.0 & flag == flag
    }

    /// Sets the bits of `flag`.
    pub fn insert(&mut self, flag: u64) {
        self.0 |= flag;
    }

    /// No flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

// ---------------------------------------------------------------------------
// ConnectionDetails / AuthDetails
// ---------------------------------------------------------------------------

/// Server-advertised properties of a connection, sent in `Connected`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// The client id the connection is identified with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Key used to resume this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,

    /// Largest accepted message, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,

    /// Largest accepted frame, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u64>,

    /// Maximum inbound message rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inbound_rate: Option<u64>,

    /// How long, in milliseconds, the server keeps connection state after
    /// a disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,

    /// Longest gap, in milliseconds, between two frames from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,

    /// Identifier of the server the connection landed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Credentials sent with an `Auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    /// The new access token.
    pub access_token: String,
}

// ---------------------------------------------------------------------------
// ProtocolMessage
// ---------------------------------------------------------------------------

/// The unit of wire transport: one frame.
///
/// ```text
/// ┌──────────────────────────────────────┐
/// │ action: Message                      │  ← what the frame is for
/// │ channel: "chat"                      │
/// │ msgSerial: 7                         │  ← assigned at send time
/// │ ┌──────────────────────────────────┐ │
/// │ │ messages: [{name, data, ...}]    │ │  ← payload carriers
/// │ └──────────────────────────────────┘ │
/// └──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    /// What the frame is for.
    pub action: Action,

    /// Frame flags.
    #[serde(default, skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,

    /// Number of serials covered by an `Ack`/`Nack`.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub count: i32,

    /// Error carried by `Error`, `Disconnected`, `Nack`, `Detached`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Frame id (ping ids travel here on `Heartbeat`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Channel name for channel-scoped actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Position in the channel's message stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,

    /// Connection id (on `Connected`, and on inbound messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Connection key (on `Connected`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,

    /// Position in the connection's inbound stream, used for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,

    /// Serial of a published frame, or start of an `Ack`/`Nack` range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Channel messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,

    /// Presence events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceMessage>,

    /// Server-advertised limits (on `Connected`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,

    /// Credentials (on client-sent `Auth`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl ProtocolMessage {
    /// Creates an otherwise-empty frame with the given action.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// A `Message` frame publishing `messages` on `channel`.
    pub fn publish(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            action: Action::Message,
            channel: Some(channel.into()),
            messages,
            ..Default::default()
        }
    }

    /// A `Presence` frame on `channel`.
    pub fn presence(
        channel: impl Into<String>,
        presence: Vec<PresenceMessage>,
    ) -> Self {
        Self {
            action: Action::Presence,
            channel: Some(channel.into()),
            presence,
            ..Default::default()
        }
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags.contains(flag)
    }

    /// The inclusive serial range an `Ack`/`Nack` covers.
    ///
    /// A missing `count` covers a single serial. A range whose end does not
    /// fit in an `i64` is treated as no range.
    pub fn serial_range(&self) -> Option<(i64, i64)> {
        let start = self.msg_serial?;
        let extra = i64::from(self.count.max(1)) - 1;
        Some((start, start.checked_add(extra)?))
    }
}

// =========================================================================
// Tests
// =========================================================================
