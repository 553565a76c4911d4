//! Payload encoding for tidewire.
//!
//! Application payloads pass through a fixed chain of reversible transforms
//! before they are embedded in a protocol frame:
//!
//! - **json** structured values become JSON text;
//! - **utf-8** text becomes bytes, when a cipher needs bytes;
//! - **cipher** bytes are encrypted with the channel's [`CipherParams`];
//! - **vcdiff** (receive only) a diff is applied to the previous payload;
//! - **base64** bytes become text, under the JSON wire format.
//!
//! Each step that runs records itself in the payload's `encoding` field, so
//! the receiver knows exactly what to undo and in which order.
//!
//! ```rust
//! use tidewire_encoding::{decode_message, encode_message, DecodingContext, EncodeOptions};
//! use tidewire_protocol::{Data, Format, Message};
//!
//! let mut msg = Message::new("score", serde_json::json!({"points": 3}));
//! encode_message(&mut msg, &EncodeOptions { format: Format::Json, cipher: None }).unwrap();
//! assert_eq!(msg.encoding.as_deref(), Some("json"));
//!
//! decode_message(&mut msg, None, &mut DecodingContext::default()).unwrap();
//! assert_eq!(msg.data, Some(Data::Json(serde_json::json!({"points": 3}))));
//! ```

mod chain;
mod cipher;
mod context;
mod error;
mod transform;
pub mod vcdiff;

pub use chain::{decode_message, decode_presence, encode_message, encode_payload, encode_presence};
pub use cipher::{CipherAlgorithm, CipherParams};
pub use context::DecodingContext;
pub use error::{DecodeFailure, DeltaError, EncodingError};
pub use transform::{
    Base64Transform, CipherTransform, DecodeOptions, DeltaTransform, EncodeOptions,
    JsonTransform, Payload, Transform, Utf8Transform,
};

/// Per-channel payload options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Encrypt published payloads and decrypt received ones.
    pub cipher: Option<CipherParams>,
}

impl ChannelOptions {
    /// Options with encryption enabled.
    pub fn with_cipher(cipher: CipherParams) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }
}
