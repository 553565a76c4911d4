//! The fixed, ordered encoder chain.
//!
//! ```text
//! encode →  json → utf-8 → cipher → vcdiff → base64  → wire
//! decode ←  json ← utf-8 ← cipher ← vcdiff ← base64  ← wire
//! ```
//!
//! Encoding runs every transform in order; each decides for itself whether
//! it applies. Decoding reads the payload's encoding stack from the right
//! (last applied) and hands each segment to the transform that handles it.

use serde_json::Value;
use tidewire_protocol::{Data, Message, PresenceMessage};
use tracing::trace;

use crate::context::DecodingContext;
use crate::error::DecodeFailure;
use crate::transform::{
    Base64Transform, CipherTransform, DecodeOptions, DeltaTransform, EncodeOptions,
    JsonTransform, Payload, Transform, Utf8Transform,
};
use crate::{CipherParams, EncodingError};

static CHAIN: [&dyn Transform; 5] = [
    &JsonTransform,
    &Utf8Transform,
    &CipherTransform,
    &DeltaTransform,
    &Base64Transform,
];

/// Segments that belong to the transport level: the delta base is captured
/// once these have been undone.
fn is_transport_segment(segment: &str) -> bool {
    matches!(segment, "base64" | "vcdiff")
}

fn validate_publishable(data: &Option<Data>) -> Result<(), EncodingError> {
    match data {
        Some(Data::Json(Value::Number(_))) => Err(EncodingError::UnsupportedDataType("number")),
        Some(Data::Json(Value::Bool(_))) => Err(EncodingError::UnsupportedDataType("boolean")),
        Some(Data::Json(Value::Null)) => Err(EncodingError::UnsupportedDataType("null")),
        _ => Ok(()),
    }
}

/// Runs the whole chain over a payload.
///
/// # Errors
/// Rejects bare numbers, booleans and null, and propagates the first
/// transform failure.
pub fn encode_payload(payload: &mut Payload, opts: &EncodeOptions<'_>) -> Result<(), EncodingError> {
    validate_publishable(&payload.data)?;
    if let Some(Data::Json(Value::String(s))) = &mut payload.data {
        let s = std::mem::take(s);
        payload.data = Some(Data::String(s));
    }
    for transform in CHAIN {
        transform.encode(payload, opts)?;
    }
    Ok(())
}

/// Encodes a message's data in place for sending.
pub fn encode_message(msg: &mut Message, opts: &EncodeOptions<'_>) -> Result<(), EncodingError> {
    let mut payload = Payload::new(msg.data.take(), msg.encoding.as_deref());
    let result = encode_payload(&mut payload, opts);
    msg.encoding = payload.encoding_string();
    msg.data = payload.data;
    result
}

/// Encodes a presence message's data in place for sending.
pub fn encode_presence(
    msg: &mut PresenceMessage,
    opts: &EncodeOptions<'_>,
) -> Result<(), EncodingError> {
    let mut payload = Payload::new(msg.data.take(), msg.encoding.as_deref());
    let result = encode_payload(&mut payload, opts);
    msg.encoding = payload.encoding_string();
    msg.data = payload.data;
    result
}

/// The outcome of undoing a payload's encoding stack.
struct Undone {
    base: Option<Vec<u8>>,
}

fn to_base_bytes(data: &Data) -> Vec<u8> {
    match data {
        Data::String(s) => s.as_bytes().to_vec(),
        Data::Binary(b) => b.clone(),
        Data::Json(v) => v.to_string().into_bytes(),
    }
}

fn decode_inner(
    payload: &mut Payload,
    opts: &DecodeOptions<'_>,
    original: &Payload,
) -> Result<Undone, Box<DecodeFailure>> {
    let mut undone = Vec::new();
    let mut base = None;

    while let Some(segment) = payload.encoding.last().cloned() {
        if base.is_none() && !is_transport_segment(&segment) {
            base = payload.data.as_ref().map(to_base_bytes);
        }
        let Some(data) = payload.data.take() else {
            // Nothing left to transform; the rest of the stack is vacuous.
            payload.encoding.clear();
            break;
        };
        let Some(transform) = CHAIN.iter().find(|t| t.handles(&segment)) else {
            payload.data = Some(data);
            return Err(failure(
                EncodingError::UnknownEncoding(segment.clone()),
                segment,
                undone,
                payload,
                original,
            ));
        };
        match transform.decode(&segment, data.clone(), opts) {
            Ok(decoded) => {
                trace!(segment = %segment, "undid encoding segment");
                payload.data = Some(decoded);
                payload.encoding.pop();
                undone.push(segment);
            }
            Err(error) => {
                payload.data = Some(data);
                return Err(failure(error, segment, undone, payload, original));
            }
        }
    }

    if base.is_none() {
        base = payload.data.as_ref().map(to_base_bytes);
    }
    Ok(Undone { base })
}

fn failure(
    error: EncodingError,
    failed_segment: String,
    undone: Vec<String>,
    payload: &Payload,
    original: &Payload,
) -> Box<DecodeFailure> {
    Box::new(DecodeFailure {
        error,
        failed_segment,
        undone,
        remaining: payload.encoding_string(),
        original: original.clone(),
    })
}

/// Decodes a received message's data in place.
///
/// On success the message holds its application-level data with no
/// encoding, and `context` holds this message as the next delta base. On
/// failure the message keeps whatever was decoded so far plus the remaining
/// encoding, and `context` is untouched.
///
/// # Errors
/// Returns a [`DecodeFailure`] naming the segment that failed.
pub fn decode_message(
    msg: &mut Message,
    cipher: Option<&CipherParams>,
    context: &mut DecodingContext,
) -> Result<(), Box<DecodeFailure>> {
    let original = Payload::new(msg.data.clone(), msg.encoding.as_deref());
    let mut payload = original.clone();
    let result = {
        let opts = DecodeOptions {
            cipher,
            context: &*context,
            delta_from: msg.delta_from(),
        };
        decode_inner(&mut payload, &opts, &original)
    };
    msg.encoding = payload.encoding_string();
    msg.data = payload.data;
    let undone = result?;
    if let Some(base) = undone.base {
        context.record(base, msg.id.clone());
    }
    Ok(())
}

/// Decodes a received presence message's data in place.
///
/// Presence payloads are never delta-compressed, so no context is kept.
pub fn decode_presence(
    msg: &mut PresenceMessage,
    cipher: Option<&CipherParams>,
) -> Result<(), Box<DecodeFailure>> {
    let original = Payload::new(msg.data.clone(), msg.encoding.as_deref());
    let mut payload = original.clone();
    let context = DecodingContext::default();
    let opts = DecodeOptions {
        cipher,
        context: &context,
        delta_from: None,
    };
    let result = decode_inner(&mut payload, &opts, &original);
    msg.encoding = payload.encoding_string();
    msg.data = payload.data;
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CipherAlgorithm;
    use serde_json::json;
    use tidewire_protocol::Format;

    fn opts(format: Format, cipher: Option<&CipherParams>) -> EncodeOptions<'_> {
        EncodeOptions { format, cipher }
    }

    #[test]
    fn test_encode_string_text_format_no_cipher_has_no_encoding() {
        let mut msg = Message::new("m", "hello");
        encode_message(&mut msg, &opts(Format::Json, None)).unwrap();
        assert_eq!(msg.data, Some(Data::from("hello")));
        assert_eq!(msg.encoding, None);
    }

    #[test]
    fn test_encode_bytes_text_format_aes256_stacks_cipher_and_base64() {
        let cipher = CipherParams::generate(CipherAlgorithm::Aes256Cbc);
        let mut msg = Message::new("m", vec![1u8, 2, 3]);
        encode_message(&mut msg, &opts(Format::Json, Some(&cipher))).unwrap();
        assert_eq!(msg.encoding.as_deref(), Some("cipher+aes-256-cbc/base64"));
        assert!(matches!(msg.data, Some(Data::String(_))));

        let mut ctx = DecodingContext::default();
        decode_message(&mut msg, Some(&cipher), &mut ctx).unwrap();
        assert_eq!(msg.data, Some(Data::Binary(vec![1, 2, 3])));
        assert_eq!(msg.encoding, None);
    }

    #[test]
    fn test_encode_json_object_with_cipher_uses_full_chain() {
        let cipher = CipherParams::generate(CipherAlgorithm::Aes128Cbc);
        let value = json!({"score": 10, "tags": ["a"]});
        let mut msg = Message::new("m", value.clone());
        encode_message(&mut msg, &opts(Format::Json, Some(&cipher))).unwrap();
        assert_eq!(
            msg.encoding.as_deref(),
            Some("json/utf-8/cipher+aes-128-cbc/base64")
        );

        let mut ctx = DecodingContext::default();
        decode_message(&mut msg, Some(&cipher), &mut ctx).unwrap();
        assert_eq!(msg.data, Some(Data::Json(value)));
    }

    #[test]
    fn test_encode_binary_format_keeps_raw_bytes() {
        let mut msg = Message::new("m", vec![9u8, 8]);
        encode_message(&mut msg, &opts(Format::MsgPack, None)).unwrap();
        assert_eq!(msg.data, Some(Data::Binary(vec![9, 8])));
        assert_eq!(msg.encoding, None);
    }

    #[test]
    fn test_encode_rejects_bare_scalars() {
        for value in [json!(1), json!(true), json!(null)] {
            let mut msg = Message::new("m", value);
            let err = encode_message(&mut msg, &opts(Format::Json, None)).unwrap_err();
            assert!(matches!(err, EncodingError::UnsupportedDataType(_)));
        }
    }

    #[test]
    fn test_encode_json_array_round_trips() {
        let mut msg = Message::new("m", json!([1, 2, 3]));
        encode_message(&mut msg, &opts(Format::Json, None)).unwrap();
        assert_eq!(msg.encoding.as_deref(), Some("json"));
        assert_eq!(msg.data, Some(Data::from("[1,2,3]")));
        decode_message(&mut msg, None, &mut DecodingContext::default()).unwrap();
        assert_eq!(msg.data, Some(Data::Json(json!([1, 2, 3]))));
    }

    #[test]
    fn test_decode_unknown_segment_reports_remaining_stack() {
        let mut msg = Message {
            data: Some(Data::from("AQI=")),
            encoding: Some("rot13/base64".into()),
            ..Default::default()
        };
        let failure = decode_message(&mut msg, None, &mut DecodingContext::default()).unwrap_err();
        assert!(matches!(failure.error, EncodingError::UnknownEncoding(ref s) if s == "rot13"));
        assert_eq!(failure.failed_segment, "rot13");
        assert_eq!(failure.undone, ["base64"]);
        assert_eq!(failure.remaining.as_deref(), Some("rot13"));
        assert_eq!(failure.original.data, Some(Data::from("AQI=")));
        // The message keeps what was decoded so far.
        assert_eq!(msg.data, Some(Data::Binary(vec![1, 2])));
        assert_eq!(msg.encoding.as_deref(), Some("rot13"));
    }

    #[test]
    fn test_decode_cipher_mismatch_is_hard_failure() {
        let sender = CipherParams::generate(CipherAlgorithm::Aes128Cbc);
        let receiver = CipherParams::generate(CipherAlgorithm::Aes256Cbc);
        let mut msg = Message::new("m", "secret");
        encode_message(&mut msg, &opts(Format::Json, Some(&sender))).unwrap();
        let failure =
            decode_message(&mut msg, Some(&receiver), &mut DecodingContext::default()).unwrap_err();
        assert!(matches!(failure.error, EncodingError::CipherMismatch { .. }));
        assert_eq!(failure.undone, ["base64"]);
    }

    #[test]
    fn test_decode_records_delta_base_and_applies_next_delta() {
        let mut ctx = DecodingContext::default();
        let mut first = Message {
            id: Some("m:0".into()),
            data: Some(Data::from("hello world")),
            ..Default::default()
        };
        decode_message(&mut first, None, &mut ctx).unwrap();
        assert_eq!(ctx.base_payload(), Some(&b"hello world"[..]));

        let diff = [
            0xD6, 0xC3, 0xC4, 0x00, 0x00, 0x01, 0x0B, 0x00, 0x09, 0x0C, 0x00, 0x01, 0x02,
            0x01, 0x21, 0x1B, 0x02, 0x00,
        ];
        let mut second = Message {
            id: Some("m:1".into()),
            data: Some(Data::Binary(diff.to_vec())),
            encoding: Some("utf-8/vcdiff".into()),
            extras: Some(json!({"delta": {"from": "m:0", "format": "vcdiff"}})),
            ..Default::default()
        };
        decode_message(&mut second, None, &mut ctx).unwrap();
        assert_eq!(second.data, Some(Data::from("hello world!")));
        assert_eq!(ctx.base_payload(), Some(&b"hello world!"[..]));
        assert_eq!(ctx.last_message_id(), Some("m:1"));
    }

    #[test]
    fn test_decode_delta_failure_leaves_context_untouched() {
        let mut ctx = DecodingContext::default();
        ctx.record(b"base".to_vec(), Some("m:0".into()));
        let mut msg = Message {
            id: Some("m:5".into()),
            data: Some(Data::Binary(vec![1, 2, 3])),
            encoding: Some("vcdiff".into()),
            ..Default::default()
        };
        let failure = decode_message(&mut msg, None, &mut ctx).unwrap_err();
        assert!(failure.is_delta_desync());
        assert_eq!(ctx.last_message_id(), Some("m:0"));
    }

    #[test]
    fn test_presence_round_trip_with_cipher() {
        let cipher = CipherParams::generate(CipherAlgorithm::Aes256Cbc);
        let mut p = PresenceMessage {
            data: Some(Data::from("here")),
            ..Default::default()
        };
        encode_presence(&mut p, &opts(Format::MsgPack, Some(&cipher))).unwrap();
        assert_eq!(p.encoding.as_deref(), Some("utf-8/cipher+aes-256-cbc"));
        decode_presence(&mut p, Some(&cipher)).unwrap();
        assert_eq!(p.data, Some(Data::from("here")));
        assert_eq!(p.encoding, None);
    }
}
