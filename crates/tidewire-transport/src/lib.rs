//! Transport abstraction layer for tidewire.
//!
//! Provides the [`Transport`] and [`Link`] traits that the connection layer
//! is written against. A transport opens links; a link carries [`Frame`]s
//! in both directions until it closes.
//!
//! The connection layer drives each link from two tasks (one reading, one
//! writing), so link methods take `&self` and return `Send` futures.
//!
//! # Feature Flags
//!
//! - `websocket` (default) WebSocket transport via `tokio-tungstenite`
//! - `tls` `wss://` support via rustls and the webpki root store

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketLink, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

pub use url::Url;

/// Opaque identifier for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Creates a new `LinkId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// One unit of data on a link.
///
/// JSON frames travel as text, MsgPack frames as binary. Receivers accept
/// either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// The frame's payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle of a single link, as reported by the link itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Opening handshake in progress.
    Connecting,
    /// Open; frames flow.
    Connected,
    /// A close was requested locally and is in progress.
    Closing,
    /// Closed, by either side or by an error.
    Closed,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A [`TransportState`] that can be shared between a link's tasks.
#[derive(Debug)]
pub struct AtomicTransportState(AtomicU8);

impl AtomicTransportState {
    /// Creates a cell holding `state`.
    pub fn new(state: TransportState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    /// Reads the current state.
    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replaces the current state.
    pub fn set(&self, state: TransportState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Opens outgoing links.
pub trait Transport: Send + Sync + 'static {
    /// The link type produced by this transport.
    type Link: Link;

    /// Opens a link to `url`, completing once the link is open.
    fn connect(
        &self,
        url: &Url,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// A single open link that carries frames both ways.
pub trait Link: Send + Sync + 'static {
    /// Sends one frame to the remote peer.
    fn send(&self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the link is cleanly closed.
    fn recv(&self) -> impl Future<Output = Result<Option<Frame>, TransportError>> + Send;

    /// Closes the link. Closing an already-closed link is not an error.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this link.
    fn id(&self) -> LinkId;

    /// The link's current lifecycle state.
    fn state(&self) -> TransportState;
}
