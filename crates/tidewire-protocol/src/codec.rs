//! Codec trait and the two wire formats.
//!
//! A connection negotiates one [`Format`] when it opens (the `format` query
//! parameter) and every frame on that connection uses it. Text frames
//! carry JSON; binary frames carry MsgPack.
//!
//! The layers above only see [`ProtocolMessage`](crate::ProtocolMessage)
//! values and pick a codec through [`Format`], so adding a format means
//! adding one `Codec` impl and one enum variant.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Converts values to bytes and back.
///
/// `Send + Sync + 'static` because codecs live inside connection tasks that
/// tokio may move between threads.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns an encode variant of [`ProtocolError`] if the value cannot be
    /// represented in this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns a decode variant of [`ProtocolError`] if the bytes are
    /// malformed, truncated, or don't match the expected shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] using JSON text (via `serde_json`).
///
/// ```rust
/// use tidewire_protocol::{Action, Codec, JsonCodec, ProtocolMessage};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&ProtocolMessage::new(Action::Heartbeat)).unwrap();
/// assert_eq!(bytes, br#"{"action":0}"#);
///
/// let decoded: ProtocolMessage = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded.action, Action::Heartbeat);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::JsonEncode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::JsonDecode)
    }
}

// ---------------------------------------------------------------------------
// MsgPackCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] using MsgPack (via `rmp-serde`).
///
/// Structs are written as maps keyed by field name, so the binary format
/// carries the same field names as the JSON one and tolerates unknown
/// fields the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(value).map_err(ProtocolError::MsgPackEncode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        rmp_serde::from_slice(data).map_err(ProtocolError::MsgPackDecode)
    }
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// The wire format negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// JSON text frames.
    #[default]
    Json,
    /// MsgPack binary frames.
    MsgPack,
}

impl Format {
    /// Value of the `format` connection query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }

    /// Whether frames in this format travel as binary.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::MsgPack)
    }

    /// Encodes a value with this format's codec.
    pub fn serialize<T: Serialize>(self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Json => JsonCodec.encode(value),
            Self::MsgPack => MsgPackCodec.encode(value),
        }
    }

    /// Decodes a value with this format's codec.
    pub fn deserialize<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, ProtocolError> {
        match self {
            Self::Json => JsonCodec.decode(data),
            Self::MsgPack => MsgPackCodec.decode(data),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Format {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "msgpack" => Ok(Self::MsgPack),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown format {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::{
        Action, AuthDetails, ConnectionDetails, Data, ErrorInfo, Flags, Message, PresenceAction,
        PresenceMessage, ProtocolMessage,
    };

    fn sample() -> ProtocolMessage {
        let mut msg = ProtocolMessage::publish("room", vec![Message::new("greeting", "hi")]);
        msg.msg_serial = Some(9);
        msg
    }

    #[test]
    fn test_json_codec_round_trip_preserves_frame() {
        let bytes = JsonCodec.encode(&sample()).unwrap();
        let decoded: ProtocolMessage = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_msgpack_codec_round_trip_preserves_frame() {
        let bytes = MsgPackCodec.encode(&sample()).unwrap();
        let decoded: ProtocolMessage = MsgPackCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, sample());
    }

    /// A frame with every field set. `binary` is the form a byte payload
    /// takes on the given framing, with its `encoding`.
    fn fully_populated(binary: (Data, Option<&str>)) -> ProtocolMessage {
        let (binary_data, binary_encoding) = binary;
        let mut flags = Flags::default();
        flags.insert(Flags::HAS_PRESENCE | Flags::RESUMED);
        ProtocolMessage {
            action: Action::Message,
            flags,
            count: 3,
            error: Some(ErrorInfo {
                href: Some("https://help.example.com/40160".into()),
                ..ErrorInfo::new(40160, Some(401), "not permitted")
            }),
            id: Some("conn-1:7".into()),
            channel: Some("prices".into()),
            channel_serial: Some("a:17".into()),
            connection_id: Some("conn-1".into()),
            connection_key: Some("key-1".into()),
            connection_serial: Some(42),
            msg_serial: Some(-1),
            timestamp: Some(1_700_000_000_000),
            messages: vec![
                Message {
                    id: Some("conn-1:7:0".into()),
                    client_id: Some("alice".into()),
                    connection_id: Some("conn-1".into()),
                    name: Some("tick".into()),
                    data: Some(binary_data.clone()),
                    encoding: binary_encoding.map(str::to_string),
                    timestamp: Some(1_700_000_000_001),
                    extras: Some(json!({"delta": {"from": "conn-1:6:0", "format": "vcdiff"}})),
                },
                Message {
                    name: Some("quote".into()),
                    data: Some(Data::Json(json!({"bid": 1.25, "size": -3, "tags": ["a", true, null]}))),
                    ..Default::default()
                },
                Message::new("note", "plain text"),
            ],
            presence: vec![
                PresenceMessage {
                    id: Some("conn-1:7:1".into()),
                    action: PresenceAction::Update,
                    client_id: Some("bob".into()),
                    connection_id: Some("conn-2".into()),
                    data: Some(binary_data),
                    encoding: binary_encoding.map(str::to_string),
                    timestamp: Some(1_700_000_000_002),
                },
                PresenceMessage {
                    action: PresenceAction::Enter,
                    data: Some(Data::Json(json!([1, 2, 3]))),
                    ..Default::default()
                },
            ],
            connection_details: Some(ConnectionDetails {
                client_id: Some("alice".into()),
                connection_key: Some("key-1".into()),
                max_message_size: Some(65_536),
                max_frame_size: Some(524_288),
                max_inbound_rate: Some(50),
                connection_state_ttl: Some(120_000),
                max_idle_interval: Some(15_000),
                server_id: Some("frontend.1".into()),
            }),
            auth: Some(AuthDetails {
                access_token: "token-abc".into(),
            }),
        }
    }

    #[test]
    fn test_fully_populated_frame_round_trips_in_both_formats() {
        let cases = [
            // Text framing carries bytes base64-encoded.
            (Format::Json, (Data::from("AAEC/w=="), Some("base64"))),
            (Format::MsgPack, (Data::Binary(vec![0, 1, 2, 255]), None)),
        ];
        for (format, binary) in cases {
            let frame = fully_populated(binary);
            let bytes = format.serialize(&frame).unwrap();
            let decoded: ProtocolMessage = format.deserialize(&bytes).unwrap();
            assert_eq!(decoded, frame, "{format}");
        }
    }

    #[test]
    fn test_json_decode_garbage_returns_decode_error() {
        let err = JsonCodec.decode::<ProtocolMessage>(b"{not json").unwrap_err();
        assert!(err.is_decode());
        assert!(matches!(err, ProtocolError::JsonDecode(_)));
    }

    #[test]
    fn test_msgpack_decode_truncated_returns_decode_error() {
        let bytes = MsgPackCodec.encode(&sample()).unwrap();
        let err = MsgPackCodec
            .decode::<ProtocolMessage>(&bytes[..bytes.len() / 2])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MsgPackDecode(_)));
    }

    #[test]
    fn test_format_dispatches_to_matching_codec() {
        let frame = ProtocolMessage::new(Action::Heartbeat);
        let json = Format::Json.serialize(&frame).unwrap();
        assert_eq!(json, br#"{"action":0}"#);
        let packed = Format::MsgPack.serialize(&frame).unwrap();
        assert_ne!(packed, json);
        let back: ProtocolMessage = Format::MsgPack.deserialize(&packed).unwrap();
        assert_eq!(back.action, Action::Heartbeat);
    }

    #[test]
    fn test_format_parses_query_value() {
        assert_eq!("msgpack".parse::<Format>().unwrap(), Format::MsgPack);
        assert_eq!(Format::Json.as_str(), "json");
        assert!("xml".parse::<Format>().is_err());
    }
}
