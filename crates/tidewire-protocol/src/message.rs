//! Payload carriers: [`Message`], [`PresenceMessage`] and their [`Data`].
//!
//! These are the structures an application publishes and receives. Their
//! `data` field passes through the payload encoder chain, and `encoding`
//! records which transforms still have to be reversed.

use std::fmt;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// The opaque payload of a message.
///
/// On the wire `data` is either a string or a byte sequence. After the
/// encoder chain has run on receipt, it may also be a structured JSON value.
///
/// Serialization is format-aware for free: strings serialize as strings,
/// bytes as MsgPack `bin` (the JSON framing never carries raw bytes, because
/// the chain base64-encodes them first), and structured values as whatever
/// the target format uses for maps and arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Text.
    String(String),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// A structured value (object, array, or scalar received from the wire).
    Json(serde_json::Value),
}

impl Data {
    /// Returns the string if this is [`Data::String`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bytes if this is [`Data::Binary`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Approximate encoded size in bytes, used for size limits.
    pub fn size(&self) -> usize {
        match self {
            Self::String(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Json(v) => v.to_string().len(),
        }
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

impl From<serde_json::Value> for Data {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Binary(b) => serializer.serialize_bytes(b),
            Self::Json(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DataVisitor)
    }
}

/// Maps whatever the wire format produced onto a [`Data`] variant.
///
/// Strings and byte strings keep their identity; everything else becomes a
/// structured JSON value.
struct DataVisitor;

impl<'de> Visitor<'de> for DataVisitor {
    type Value = Data;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, a byte sequence, or a structured value")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Data, E> {
        Ok(Data::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Data, E> {
        Ok(Data::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Data, E> {
        Ok(Data::Binary(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Data, E> {
        Ok(Data::Binary(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Data, E> {
        Ok(Data::Json(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Data, E> {
        Ok(Data::Json(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Data, E> {
        let number = serde_json::Number::from_f64(v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
        Ok(Data::Json(number))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Data, E> {
        Ok(Data::Json(serde_json::Value::Null))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Data, A::Error> {
        let value = serde_json::Value::deserialize(
            de::value::SeqAccessDeserializer::new(seq),
        )?;
        Ok(Data::Json(value))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Data, A::Error> {
        let value = serde_json::Value::deserialize(
            de::value::MapAccessDeserializer::new(map),
        )?;
        Ok(Data::Json(value))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message published on, or received from, a channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id, assigned by the service if the publisher did not set it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Client id of the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Connection id of the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,

    /// `/`-delimited transforms still to be reversed on `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Opaque metadata. Delta-compressed messages carry
    /// `{"delta": {"from": "<id>", "format": "vcdiff"}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

impl Message {
    /// Creates a message with a name and a payload.
    pub fn new(name: impl Into<String>, data: impl Into<Data>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// The id of the message this one is a delta against, if any.
    pub fn delta_from(&self) -> Option<&str> {
        self.extras
            .as_ref()?
            .get("delta")?
            .get("from")?
            .as_str()
    }

    /// Approximate size counted against the server's message size limit:
    /// name, client id, data and extras.
    pub fn size(&self) -> usize {
        self.name.as_deref().map_or(0, str::len)
            + self.client_id.as_deref().map_or(0, str::len)
            + self.data.as_ref().map_or(0, Data::size)
            + self.extras.as_ref().map_or(0, |e| e.to_string().len())
    }
}

// ---------------------------------------------------------------------------
// PresenceMessage
// ---------------------------------------------------------------------------

/// The presence event a [`PresenceMessage`] describes.
///
/// Serialized as a small integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresenceAction {
    /// The member is not present.
    #[default]
    Absent,
    /// The member is present (synthesised during sync).
    Present,
    /// The member entered.
    Enter,
    /// The member left.
    Leave,
    /// The member updated its data.
    Update,
}

impl PresenceAction {
    /// The numeric wire value.
    pub fn code(self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Present => 1,
            Self::Enter => 2,
            Self::Leave => 3,
            Self::Update => 4,
        }
    }

    /// Parses a numeric wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Absent,
            1 => Self::Present,
            2 => Self::Enter,
            3 => Self::Leave,
            4 => Self::Update,
            _ => return None,
        })
    }
}

impl Serialize for PresenceAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for PresenceAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| {
            de::Error::custom(format!("unknown presence action {code}"))
        })
    }
}

/// A presence event for one member of a channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// Unique id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// What happened.
    #[serde(default)]
    pub action: PresenceAction,

    /// Client id of the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Connection id of the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Member data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,

    /// `/`-delimited transforms still to be reversed on `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,

    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    /// Approximate size counted against the server's message size limit:
    /// client id and data.
    pub fn size(&self) -> usize {
        self.client_id.as_deref().map_or(0, str::len) + self.data.as_ref().map_or(0, Data::size)
    }
}
