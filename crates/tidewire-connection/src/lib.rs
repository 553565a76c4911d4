//! Connection management for tidewire.
//!
//! A [`ConnectionManager`] keeps one realtime connection alive across
//! network failures:
//!
//! 1. **State machine**: a pure [`StateMachine`] decides every transition
//!    and emits [`Command`]s for the manager to carry out.
//! 2. **Retry policy**: backoff with jitter, fallback hosts and a
//!    connectivity check ([`retry`], [`ConnectivityProbe`]).
//! 3. **Acknowledgements**: the [`AckProcessor`] numbers outgoing messages
//!    and resolves them when the server acks or nacks.
//! 4. **Resume**: after a brief drop the same connection is resumed and
//!    unacknowledged messages are sent again.
//!
//! # How it fits in the stack
//!
//! ```text
//! Client layer (above)       ← channels, publish, subscribe
//!     ↕
//! Connection layer (this crate)  ← states, retries, acks, resume
//!     ↕
//! Encoding + protocol (below)    ← payload transforms, frames
//!     ↕
//! Transport (below)              ← links
//! ```

mod ack;
mod auth;
mod config;
mod connectivity;
mod error;
mod manager;
mod params;
pub mod retry;
mod state;
mod timers;

pub use ack::{AckProcessor, Completion, SharedAckProcessor};
pub use auth::{AuthOptions, TokenCallback, TokenFuture};
pub use config::{
    ClientOptions, DEFAULT_CONNECTIVITY_CHECK_URL, DEFAULT_FALLBACK_HOSTS, DEFAULT_HOST,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use connectivity::{ConnectivityProbe, HttpConnectivityProbe, StaticConnectivity};
pub use error::{transport_error_info, ConnectionError, TimerError};
pub use manager::{decode_frame, encode_frame, ConnectionManager, InboundEvent};
pub use params::{ConnectMode, PROTOCOL_VERSION};
pub use retry::{ConnectionAttempts, FailureRecord, HostSelector};
pub use state::{
    Command, ConnectionInfo, ConnectionState, ConnectionStateChange, Event, SendDisposition,
    StateMachine,
};
pub use timers::{TimerFired, TimerKind, Timers};
