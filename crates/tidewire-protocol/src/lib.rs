//! Wire protocol for tidewire.
//!
//! This crate defines what travels between a client and the service:
//!
//! - **Types** ([`ProtocolMessage`], [`Action`], [`Message`],
//!   [`PresenceMessage`], [`ErrorInfo`]) the frame model.
//! - **Codecs** ([`Codec`], [`JsonCodec`], [`MsgPackCodec`], [`Format`])
//!   how frames become bytes.
//! - **Errors** ([`ProtocolError`]) what can go wrong in between.
//!
//! # Architecture
//!
//! The protocol layer has no notion of connections or payload encodings.
//! It only turns frames into bytes and back.
//!
//! ```text
//! Transport (frames of bytes) → Protocol (ProtocolMessage) → Connection
//! ```

mod codec;
mod error;
mod error_info;
mod message;
mod types;

pub use codec::{Codec, Format, JsonCodec, MsgPackCodec};
pub use error::ProtocolError;
pub use error_info::{codes, ErrorInfo};
pub use message::{Data, Message, PresenceAction, PresenceMessage};
pub use types::{Action, AuthDetails, ConnectionDetails, Flags, ProtocolMessage};
