//! Server-compatible error descriptions.
//!
//! [`ErrorInfo`] is the error shape the service sends inside `Error`,
//! `Disconnected`, `Nack` and `Detached` frames. The client reuses the same
//! shape for every application-visible failure (a failed publish, a state
//! change reason) so callers handle one type no matter where the error came
//! from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known error codes.
///
/// Codes are five-digit numbers; the first three digits carry the matching
/// HTTP status class (`401xx` → 401, `800xx` → connection errors).
pub mod codes {
    /// Generic bad request.
    pub const BAD_REQUEST: i32 = 40000;
    /// The message exceeds the server-advertised maximum size.
    pub const MAX_MESSAGE_SIZE_EXCEEDED: i32 = 40009;
    /// A message carries a client id that conflicts with the connection's.
    pub const INCOMPATIBLE_CLIENT_ID: i32 = 40012;
    /// The payload could not be decoded by the encoder chain.
    pub const DECODING_FAILED: i32 = 40013;
    /// A delta could not be applied because the local base is out of sync.
    pub const DELTA_DECODE_FAILED: i32 = 40018;
    /// Start of the token error range (inclusive).
    pub const TOKEN_ERROR_START: i32 = 40140;
    /// End of the token error range (exclusive).
    pub const TOKEN_ERROR_END: i32 = 40150;
    /// The token has expired.
    pub const TOKEN_EXPIRED: i32 = 40142;
    /// No way to renew the token was configured.
    pub const TOKEN_NOT_RENEWABLE: i32 = 40171;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = 50000;
    /// A request to the service timed out.
    pub const TIMEOUT: i32 = 50003;
    /// The connection failed and will not be retried.
    pub const CONNECTION_FAILED: i32 = 80000;
    /// The connection is suspended.
    pub const CONNECTION_SUSPENDED: i32 = 80002;
    /// The connection is disconnected.
    pub const DISCONNECTED: i32 = 80003;
    /// A transport-level connection error (refused, reset, unreachable).
    pub const CONNECTION_ERROR: i32 = 80013;
    /// The connection attempt timed out.
    pub const CONNECTION_TIMED_OUT: i32 = 80014;
    /// The connection has been closed.
    pub const CONNECTION_CLOSED: i32 = 80017;
    /// A message was rejected by the server without a reason.
    pub const NACK: i32 = 80018;
    /// Unknown connection-level error.
    pub const UNKNOWN_CONNECTION_ERROR: i32 = 50002;
    /// Unknown channel-level error.
    pub const UNKNOWN_CHANNEL_ERROR: i32 = 50001;
}

/// An error as described by the service (or synthesised by the client in
/// the same shape).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Human-readable description.
    #[serde(default)]
    pub message: String,

    /// Five-digit error code, see [`codes`].
    #[serde(default)]
    pub code: i32,

    /// HTTP-style status, when the error has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    /// Link to documentation about the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ErrorInfo {
    /// Creates an error with a code, an optional status, and a message.
    pub fn new(
        code: i32,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            code,
            status_code,
            href: None,
        }
    }

    /// A token-class error: the credentials expired or were rejected and
    /// a renewal may fix the problem.
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_START..codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// A 5xx-class error reported by the service.
    pub fn is_server_error(&self) -> bool {
        self.status_code.is_some_and(|s| s >= 500)
    }

    /// Whether a connection that failed with this error may be retried.
    ///
    /// An error is retriable when it has no status code (network-level
    /// failures), is a server error (5xx), or carries one of the
    /// connection-class codes even when reported with a 4xx status.
    pub fn is_retriable(&self) -> bool {
        const CONNECTION_ERROR_CODES: &[i32] = &[
            codes::DISCONNECTED,
            codes::CONNECTION_SUSPENDED,
            codes::CONNECTION_FAILED,
            codes::CONNECTION_CLOSED,
            codes::UNKNOWN_CONNECTION_ERROR,
            codes::UNKNOWN_CHANNEL_ERROR,
        ];
        match self.status_code {
            None => true,
            Some(status) if status >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(
                f,
                "{} (code {}, status {})",
                self.message, self.code, status
            ),
            None => write!(f, "{} (code {})", self.message, self.code),
        }
    }
}

impl std::error::Error for ErrorInfo {}
