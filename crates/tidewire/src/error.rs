//! Unified error type for the tidewire client.

use tidewire_connection::ConnectionError;
use tidewire_encoding::EncodingError;
use tidewire_protocol::{ErrorInfo, ProtocolError};
use tidewire_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// With the `tidewire` meta-crate you deal with this single error type
/// instead of importing errors from each sub-crate; `?` converts the
/// sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TidewireError {
    /// A transport-level error (connect, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A payload could not be encoded, or a cipher could not be set up.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The connection refused or failed an operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A channel operation failed.
    #[error("channel {channel}: {error}")]
    Channel {
        /// The channel.
        channel: String,
        /// What the server (or the client) reported.
        error: ErrorInfo,
    },
}

impl TidewireError {
    /// The service-compatible error behind this one, if there is one.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Connection(ConnectionError::Rejected(info)) => Some(info),
            Self::Channel { error, .. } => Some(error),
            _ => None,
        }
    }
}
