//! Error types for the protocol layer.
//!
//! Each crate in tidewire defines its own error enum. A `ProtocolError`
//! always means the problem is in turning frames into bytes or bytes into
//! frames, never in networking or connection state.

/// Errors that can occur while encoding or decoding protocol frames.
///
/// The variants keep the original codec error as their source so the
/// underlying cause (unexpected end of input, wrong type, ...) shows up
/// in logs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serializing a frame to JSON failed.
    #[error("json encode failed: {0}")]
    JsonEncode(#[source] serde_json::Error),

    /// The bytes are not a valid JSON protocol frame.
    ///
    /// Common causes: malformed JSON, truncated frames, an unknown
    /// action number, or a field with the wrong type.
    #[error("json decode failed: {0}")]
    JsonDecode(#[source] serde_json::Error),

    /// Serializing a frame to MsgPack failed.
    #[error("msgpack encode failed: {0}")]
    MsgPackEncode(#[source] rmp_serde::encode::Error),

    /// The bytes are not a valid MsgPack protocol frame.
    #[error("msgpack decode failed: {0}")]
    MsgPackDecode(#[source] rmp_serde::decode::Error),

    /// The frame decoded, but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

impl ProtocolError {
    /// Returns `true` for errors raised while reading bytes off the wire.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::JsonDecode(_) | Self::MsgPackDecode(_))
    }
}
