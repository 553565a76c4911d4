//! Per-channel state carried between decodes.

/// The previous payload on a channel, kept as the base for the next delta.
///
/// The base is captured at the delta level: after the transport-level
/// segments (`base64`, `vcdiff`) are undone and before anything inner
/// (`cipher`, `utf-8`, `json`) is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodingContext {
    base_payload: Option<Vec<u8>>,
    last_message_id: Option<String>,
}

impl DecodingContext {
    /// The cached base payload, if one has been recorded.
    pub fn base_payload(&self) -> Option<&[u8]> {
        self.base_payload.as_deref()
    }

    /// The id of the message the base came from.
    pub fn last_message_id(&self) -> Option<&str> {
        self.last_message_id.as_deref()
    }

    /// Replaces the base with a newly decoded payload.
    pub fn record(&mut self, base: Vec<u8>, message_id: Option<String>) {
        self.base_payload = Some(base);
        self.last_message_id = message_id;
    }

    /// Forgets the base, e.g. after a desync or a channel reattach.
    pub fn clear(&mut self) {
        self.base_payload = None;
        self.last_message_id = None;
    }
}
