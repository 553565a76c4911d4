//! Error types for the payload encoder chain.

use tidewire_protocol::{codes, ErrorInfo};

use crate::vcdiff::VcdiffError;
use crate::Payload;

/// Why a delta could not be applied.
///
/// Every variant means the local base has drifted from the server's, and
/// the channel needs to resynchronise before deltas can be applied again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    /// No previous payload is cached for the channel.
    #[error("no base payload to apply the delta to")]
    MissingBase,

    /// The delta was computed against a different message than the cached
    /// base.
    #[error("delta is against {expected:?}, cached base is {found:?}")]
    BaseMismatch {
        /// The message id the delta was computed against.
        expected: String,
        /// The id of the cached base (if any).
        found: Option<String>,
    },

    /// The diff itself is malformed or does not apply.
    #[error(transparent)]
    Vcdiff(#[from] VcdiffError),
}

/// Errors raised by a single transform in the chain.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    /// Only strings, byte sequences, and JSON objects/arrays can be sent.
    #[error("unsupported payload type: {0}")]
    UnsupportedDataType(&'static str),

    /// A segment met data of the wrong shape (e.g. `base64` over bytes).
    #[error("{segment} cannot be applied to {found} data")]
    UnexpectedData {
        /// The segment being applied.
        segment: String,
        /// What the data actually was.
        found: &'static str,
    },

    /// JSON serialization or parsing failed.
    #[error("json transform failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Bytes are not valid UTF-8.
    #[error("utf-8 transform failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// A base64 string did not decode.
    #[error("base64 transform failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload is encrypted with a different algorithm than configured.
    #[error("payload cipher {found} does not match configured {configured}")]
    CipherMismatch {
        /// The algorithm from the channel's cipher params.
        configured: String,
        /// The algorithm named by the payload's encoding.
        found: String,
    },

    /// A cipher segment was found but the channel has no cipher params.
    #[error("payload is encrypted with {0} but no cipher is configured")]
    CipherNotConfigured(String),

    /// Encryption or decryption itself failed (bad key size, bad padding).
    #[error("cipher failed: {0}")]
    Cipher(String),

    /// Delta reconstruction failed; the channel needs resynchronising.
    #[error("delta decode failed: {0}")]
    DeltaDesync(#[source] DeltaError),

    /// No transform understands this encoding segment.
    #[error("unknown encoding {0:?}")]
    UnknownEncoding(String),
}

impl EncodingError {
    /// Whether this is a delta failure that calls for a resync.
    pub fn is_delta_desync(&self) -> bool {
        matches!(self, Self::DeltaDesync(_))
    }

    /// The application-visible form of this error.
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = if self.is_delta_desync() {
            codes::DELTA_DECODE_FAILED
        } else {
            codes::DECODING_FAILED
        };
        ErrorInfo::new(code, Some(400), self.to_string())
    }
}

impl From<DeltaError> for EncodingError {
    fn from(err: DeltaError) -> Self {
        Self::DeltaDesync(err)
    }
}

/// A decode that stopped part-way through the encoding stack.
///
/// The message that failed keeps the partially decoded data and the
/// remaining encoding; this report additionally keeps the payload exactly as
/// it arrived, so nothing received is ever lost.
#[derive(Debug, thiserror::Error)]
#[error("decoding {failed_segment:?} failed: {error}")]
pub struct DecodeFailure {
    /// What went wrong.
    #[source]
    pub error: EncodingError,
    /// The segment whose transform failed.
    pub failed_segment: String,
    /// Segments successfully undone before the failure, outermost first.
    pub undone: Vec<String>,
    /// The encoding still left on the message, failed segment included.
    pub remaining: Option<String>,
    /// The payload as received, before any transform was undone.
    pub original: Payload,
}

impl DecodeFailure {
    /// Shorthand for [`EncodingError::is_delta_desync`].
    pub fn is_delta_desync(&self) -> bool {
        self.error.is_delta_desync()
    }
}
