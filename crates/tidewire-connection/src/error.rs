//! Error types for the connection layer.

use tidewire_encoding::EncodingError;
use tidewire_protocol::{codes, ErrorInfo, ProtocolError};
use tidewire_transport::TransportError;

use crate::timers::TimerKind;

/// Errors returned by [`ConnectionManager`](crate::ConnectionManager)
/// operations themselves.
///
/// Failures of an individual publish are reported as [`ErrorInfo`] through
/// its completion instead, so they can carry the server's error code.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection actor is gone; no further commands can be delivered.
    #[error("connection manager has shut down")]
    Shutdown,

    /// The client options cannot produce a working connection.
    #[error("invalid client options: {0}")]
    InvalidOptions(String),

    /// The connection URL could not be built.
    #[error("invalid connection url: {0}")]
    Url(#[from] url::ParseError),

    /// A frame could not be serialized.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A payload could not be encoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation was refused by the connection or by the server.
    #[error(transparent)]
    Rejected(#[from] ErrorInfo),
}

impl ConnectionError {
    /// Describes this error in the shape completions and state changes
    /// carry.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            Self::Shutdown => ErrorInfo::new(codes::CONNECTION_CLOSED, None, self.to_string()),
            Self::InvalidOptions(_) | Self::Protocol(_) => {
                ErrorInfo::new(codes::BAD_REQUEST, Some(400), self.to_string())
            }
            Self::Url(_) => ErrorInfo::new(codes::CONNECTION_ERROR, Some(400), self.to_string()),
            Self::Encoding(e) => e.to_error_info(),
            Self::Transport(e) => transport_error_info(e),
            Self::Rejected(info) => info.clone(),
        }
    }
}

/// Misuse of the connection's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// A timer of this kind is already running.
    #[error("timer {0} is already active")]
    AlreadyActive(TimerKind),
}

/// Describes a transport failure in the shape the state machine and the
/// application see.
///
/// Failures with an HTTP status (a rejected upgrade) keep the status, so
/// 5xx responses stay retriable and 4xx responses are fatal. Everything else
/// is a plain disconnect.
pub fn transport_error_info(err: &TransportError) -> ErrorInfo {
    match err {
        TransportError::ConnectFailed { status, reason } => {
            ErrorInfo::new(codes::CONNECTION_ERROR, *status, reason.clone())
        }
        other => ErrorInfo::new(codes::DISCONNECTED, None, other.to_string()),
    }
}
