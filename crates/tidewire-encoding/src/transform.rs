//! The individual transforms of the encoder chain.
//!
//! Each transform implements [`Transform`]: `encode` may push one segment
//! onto the payload's encoding stack, `decode` undoes exactly one segment it
//! recognises. The chain decides the order.

use base64::Engine as _;
use tidewire_protocol::{Data, Format};

use crate::cipher::CipherParams;
use crate::context::DecodingContext;
use crate::error::DeltaError;
use crate::{vcdiff, EncodingError};

/// A payload moving through the chain: data plus the stack of segments
/// applied to it so far, innermost first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    /// The data in its current form.
    pub data: Option<Data>,
    /// Applied segments, in application order.
    pub encoding: Vec<String>,
}

impl Payload {
    /// Builds a payload from a message's `data` and `encoding` fields.
    pub fn new(data: Option<Data>, encoding: Option<&str>) -> Self {
        let encoding = encoding
            .filter(|e| !e.is_empty())
            .map(|e| e.split('/').map(str::to_string).collect())
            .unwrap_or_default();
        Self { data, encoding }
    }

    /// The encoding stack in wire form, `None` when empty.
    pub fn encoding_string(&self) -> Option<String> {
        if self.encoding.is_empty() {
            None
        } else {
            Some(self.encoding.join("/"))
        }
    }

    fn push(&mut self, segment: impl Into<String>) {
        self.encoding.push(segment.into());
    }
}

/// What an encode step may look at.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions<'a> {
    /// Wire format of the connection.
    pub format: Format,
    /// Channel cipher, if encryption is enabled.
    pub cipher: Option<&'a CipherParams>,
}

/// What a decode step may look at.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions<'a> {
    /// Channel cipher, if encryption is enabled.
    pub cipher: Option<&'a CipherParams>,
    /// Previous payload for delta decoding.
    pub context: &'a DecodingContext,
    /// The message id the payload's delta (if any) was computed against.
    pub delta_from: Option<&'a str>,
}

/// One reversible step of the chain.
pub trait Transform: Send + Sync {
    /// Whether this transform undoes `segment`.
    fn handles(&self, segment: &str) -> bool;

    /// Applies the transform if it is needed, pushing its segment.
    fn encode(&self, payload: &mut Payload, opts: &EncodeOptions<'_>) -> Result<(), EncodingError>;

    /// Undoes `segment`, which [`handles`](Transform::handles) accepted.
    fn decode(
        &self,
        segment: &str,
        data: Data,
        opts: &DecodeOptions<'_>,
    ) -> Result<Data, EncodingError>;
}

fn kind_of(data: &Data) -> &'static str {
    match data {
        Data::String(_) => "string",
        Data::Binary(_) => "binary",
        Data::Json(_) => "json",
    }
}

fn unexpected(segment: &str, data: &Data) -> EncodingError {
    EncodingError::UnexpectedData {
        segment: segment.to_string(),
        found: kind_of(data),
    }
}

// ---------------------------------------------------------------------------
// json
// ---------------------------------------------------------------------------

/// Structured values ⇄ JSON text.
pub struct JsonTransform;

impl Transform for JsonTransform {
    fn handles(&self, segment: &str) -> bool {
        segment == "json"
    }

    fn encode(&self, payload: &mut Payload, _: &EncodeOptions<'_>) -> Result<(), EncodingError> {
        if let Some(Data::Json(value)) = &payload.data {
            let text = serde_json::to_string(value)?;
            payload.data = Some(Data::String(text));
            payload.push("json");
        }
        Ok(())
    }

    fn decode(&self, segment: &str, data: Data, _: &DecodeOptions<'_>) -> Result<Data, EncodingError> {
        let value = match &data {
            Data::String(s) => serde_json::from_str(s)?,
            Data::Binary(b) => serde_json::from_slice(b)?,
            Data::Json(_) => return Err(unexpected(segment, &data)),
        };
        Ok(Data::Json(value))
    }
}

// ---------------------------------------------------------------------------
// utf-8
// ---------------------------------------------------------------------------

/// Text ⇄ UTF-8 bytes. Only engaged on encode when a cipher needs bytes.
pub struct Utf8Transform;

impl Transform for Utf8Transform {
    fn handles(&self, segment: &str) -> bool {
        segment == "utf-8"
    }

    fn encode(&self, payload: &mut Payload, opts: &EncodeOptions<'_>) -> Result<(), EncodingError> {
        if opts.cipher.is_none() {
            return Ok(());
        }
        if let Some(Data::String(text)) = &mut payload.data {
            let bytes = std::mem::take(text).into_bytes();
            payload.data = Some(Data::Binary(bytes));
            payload.push("utf-8");
        }
        Ok(())
    }

    fn decode(&self, segment: &str, data: Data, _: &DecodeOptions<'_>) -> Result<Data, EncodingError> {
        match data {
            Data::Binary(bytes) => Ok(Data::String(String::from_utf8(bytes)?)),
            Data::String(_) => Ok(data),
            Data::Json(_) => Err(unexpected(segment, &data)),
        }
    }
}

// ---------------------------------------------------------------------------
// cipher+<algorithm>
// ---------------------------------------------------------------------------

/// Bytes ⇄ `IV || AES-CBC ciphertext`.
pub struct CipherTransform;

const CIPHER_PREFIX: &str = "cipher+";

impl Transform for CipherTransform {
    fn handles(&self, segment: &str) -> bool {
        segment.starts_with(CIPHER_PREFIX)
    }

    fn encode(&self, payload: &mut Payload, opts: &EncodeOptions<'_>) -> Result<(), EncodingError> {
        let Some(cipher) = opts.cipher else {
            return Ok(());
        };
        let configured = cipher.encoding_segment();
        if let Some(existing) = payload.encoding.iter().find(|s| self.handles(s)) {
            if *existing != configured {
                return Err(EncodingError::CipherMismatch {
                    configured: cipher.algorithm().to_string(),
                    found: existing[CIPHER_PREFIX.len()..].to_string(),
                });
            }
            // Already encrypted with this cipher.
            return Ok(());
        }
        match payload.data.take() {
            Some(Data::Binary(plain)) => {
                payload.data = Some(Data::Binary(cipher.encrypt(&plain)?));
                payload.push(configured);
                Ok(())
            }
            Some(other) => {
                let err = unexpected(&configured, &other);
                payload.data = Some(other);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn decode(&self, segment: &str, data: Data, opts: &DecodeOptions<'_>) -> Result<Data, EncodingError> {
        let algorithm = &segment[CIPHER_PREFIX.len()..];
        let Some(cipher) = opts.cipher else {
            return Err(EncodingError::CipherNotConfigured(algorithm.to_string()));
        };
        if cipher.algorithm().as_str() != algorithm {
            return Err(EncodingError::CipherMismatch {
                configured: cipher.algorithm().to_string(),
                found: algorithm.to_string(),
            });
        }
        match data {
            Data::Binary(sealed) => Ok(Data::Binary(cipher.decrypt(&sealed)?)),
            other => Err(unexpected(segment, &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// vcdiff
// ---------------------------------------------------------------------------

/// Reconstructs a payload from the previous one plus a VCDIFF diff.
///
/// Deltas are produced by the service only, so encode does nothing.
pub struct DeltaTransform;

impl Transform for DeltaTransform {
    fn handles(&self, segment: &str) -> bool {
        segment == "vcdiff"
    }

    fn encode(&self, _: &mut Payload, _: &EncodeOptions<'_>) -> Result<(), EncodingError> {
        Ok(())
    }

    fn decode(&self, segment: &str, data: Data, opts: &DecodeOptions<'_>) -> Result<Data, EncodingError> {
        let ctx = opts.context;
        let Some(base) = ctx.base_payload() else {
            return Err(DeltaError::MissingBase.into());
        };
        if let Some(from) = opts.delta_from {
            if ctx.last_message_id() != Some(from) {
                return Err(DeltaError::BaseMismatch {
                    expected: from.to_string(),
                    found: ctx.last_message_id().map(str::to_string),
                }
                .into());
            }
        }
        let diff = match data {
            Data::Binary(diff) => diff,
            other => return Err(unexpected(segment, &other)),
        };
        let target = vcdiff::decode(base, &diff).map_err(DeltaError::from)?;
        Ok(Data::Binary(target))
    }
}

// ---------------------------------------------------------------------------
// base64
// ---------------------------------------------------------------------------

/// Bytes ⇄ base64 text, for wire formats that cannot carry raw bytes.
pub struct Base64Transform;

impl Transform for Base64Transform {
    fn handles(&self, segment: &str) -> bool {
        segment == "base64"
    }

    fn encode(&self, payload: &mut Payload, opts: &EncodeOptions<'_>) -> Result<(), EncodingError> {
        if opts.format.is_binary() {
            return Ok(());
        }
        if let Some(Data::Binary(bytes)) = &payload.data {
            let text = base64::engine::general_purpose::STANDARD.encode(bytes);
            payload.data = Some(Data::String(text));
            payload.push("base64");
        }
        Ok(())
    }

    fn decode(&self, segment: &str, data: Data, _: &DecodeOptions<'_>) -> Result<Data, EncodingError> {
        match data {
            Data::String(text) => Ok(Data::Binary(
                base64::engine::general_purpose::STANDARD.decode(text)?,
            )),
            other => Err(unexpected(segment, &other)),
        }
    }
}
