/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening the link failed.
    ///
    /// `status` is set when the server answered the upgrade request with an
    /// HTTP error instead of switching protocols.
    #[error("connect failed{}: {reason}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    ConnectFailed {
        /// HTTP status of a rejected upgrade.
        status: Option<u16>,
        /// What went wrong.
        reason: String,
    },

    /// The link was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending a frame failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving a frame failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}

impl TransportError {
    /// The HTTP status of a rejected connect, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ConnectFailed { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_display_includes_status() {
        let err = TransportError::ConnectFailed {
            status: Some(503),
            reason: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "connect failed (status 503): unavailable");
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_connect_failed_display_without_status() {
        let err = TransportError::ConnectFailed {
            status: None,
            reason: "refused".into(),
        };
        assert_eq!(err.to_string(), "connect failed: refused");
        assert_eq!(err.status(), None);
    }
}
