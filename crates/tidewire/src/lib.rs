//! # tidewire
//!
//! Realtime pub/sub client with resumable connections.
//!
//! tidewire keeps one long-lived connection to the messaging service,
//! multiplexes channels over it and acknowledges every publish. Lost
//! connections are resumed transparently; messages the server never
//! acknowledged are sent again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tidewire::prelude::*;
//!
//! # async fn run() -> Result<(), TidewireError> {
//! tidewire::init_tracing();
//!
//! let client = RealtimeClient::builder()
//!     .key("app.key:secret")
//!     .build()?;
//!
//! let chat = client.channel("chat");
//! chat.attach().await?;
//! let mut messages = chat.subscribe();
//! chat.publish("greeting", "hello").await?;
//! while let Some(msg) = messages.next().await {
//!     println!("{:?}: {:?}", msg.name, msg.data);
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod client;
mod error;
mod logging;

pub use channel::{Channel, ChannelSubscription};
pub use client::{RealtimeClient, RealtimeClientBuilder};
pub use error::TidewireError;
pub use logging::{init_tracing, init_tracing_with, DEFAULT_FILTER};

pub use tidewire_connection as connection;
pub use tidewire_encoding as encoding;
pub use tidewire_protocol as protocol;
pub use tidewire_transport as transport;

/// Commonly used types, for glob import.
pub mod prelude {
    pub use crate::{Channel, ChannelSubscription, RealtimeClient, RealtimeClientBuilder, TidewireError};
    pub use tidewire_connection::{
        AuthOptions, ClientOptions, ConnectionState, ConnectionStateChange, InboundEvent,
    };
    pub use tidewire_encoding::{CipherParams, ChannelOptions};
    pub use tidewire_protocol::{Data, ErrorInfo, Format, Message, PresenceMessage};
}
