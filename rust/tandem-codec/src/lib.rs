//! Serialization formats for tandem payloads.
//!
//! A connection agrees on exactly one [`SerializationFormat`] during the
//! handshake and keeps it for its whole life. Every typed value that crosses
//! the wire (requests, responses, stream elements, errors and the frame
//! headers themselves) goes through that format.
//!
//! Binary formats produce [`SerializedPayload::Binary`], text formats produce
//! [`SerializedPayload::Text`]. Decoding a payload of the wrong kind is an
//! error, not a silent conversion.

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

mod payload;

pub use payload::*;

/// Serialization format identifier.
///
/// The discriminant is the identifier exchanged during format negotiation.
/// `0` is reserved as "no common format".
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SerializationFormat {
    /// Postcard: compact binary format.
    Postcard = 1,
    /// JSON: human-readable text format (for debugging/tooling).
    Json = 2,
}

impl SerializationFormat {
    /// All formats this crate can speak, in default preference order.
    pub const ALL: [SerializationFormat; 2] =
        [SerializationFormat::Postcard, SerializationFormat::Json];

    /// Identifier used on the wire during negotiation.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Whether payloads in this format are binary (as opposed to text).
    pub fn is_binary(self) -> bool {
        match self {
            SerializationFormat::Postcard => true,
            SerializationFormat::Json => false,
        }
    }

    /// Kind of payload produced by this format.
    pub fn payload_kind(self) -> PayloadKind {
        if self.is_binary() {
            PayloadKind::Binary
        } else {
            PayloadKind::Text
        }
    }

    /// Serialize a value into a payload of this format.
    pub fn serialize<T: Serialize + ?Sized>(
        self,
        value: &T,
    ) -> Result<SerializedPayload, CodecError> {
        match self {
            SerializationFormat::Postcard => PostcardCodec::encode(value)
                .map(SerializedPayload::Binary)
                .map_err(|e| CodecError::encode(self, e)),
            SerializationFormat::Json => serde_json::to_string(value)
                .map(SerializedPayload::Text)
                .map_err(|e| CodecError::encode(self, e)),
        }
    }

    /// Deserialize a value from a payload of this format.
    pub fn deserialize<T: DeserializeOwned>(
        self,
        payload: &SerializedPayload,
    ) -> Result<T, CodecError> {
        match (self, payload) {
            (SerializationFormat::Postcard, SerializedPayload::Binary(bytes)) => {
                PostcardCodec::decode(bytes).map_err(|e| CodecError::decode(self, e))
            }
            (SerializationFormat::Json, SerializedPayload::Text(text)) => {
                serde_json::from_str(text).map_err(|e| CodecError::decode(self, e))
            }
            (_, other) => Err(CodecError::KindMismatch {
                format: self,
                expected: self.payload_kind(),
                found: other.kind(),
            }),
        }
    }

    /// Serialize a value straight into bytes, regardless of payload kind.
    ///
    /// Used for whole frames: the connection carries bytes, text formats are
    /// carried as UTF-8.
    pub fn encode_bytes<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            SerializationFormat::Postcard => {
                PostcardCodec::encode(value).map_err(|e| CodecError::encode(self, e))
            }
            SerializationFormat::Json => {
                JsonCodec::encode(value).map_err(|e| CodecError::encode(self, e))
            }
        }
    }

    /// Inverse of [`SerializationFormat::encode_bytes`].
    pub fn decode_bytes<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            SerializationFormat::Postcard => {
                PostcardCodec::decode(bytes).map_err(|e| CodecError::decode(self, e))
            }
            SerializationFormat::Json => {
                JsonCodec::decode(bytes).map_err(|e| CodecError::decode(self, e))
            }
        }
    }
}

impl TryFrom<u8> for SerializationFormat {
    type Error = UnknownFormat;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(SerializationFormat::Postcard),
            2 => Ok(SerializationFormat::Json),
            _ => Err(UnknownFormat(v)),
        }
    }
}

impl From<SerializationFormat> for u8 {
    fn from(format: SerializationFormat) -> u8 {
        format as u8
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationFormat::Postcard => write!(f, "postcard"),
            SerializationFormat::Json => write!(f, "json"),
        }
    }
}

/// Error when converting from an unknown format identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFormat(pub u8);

impl fmt::Display for UnknownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown serialization format: {}", self.0)
    }
}

impl std::error::Error for UnknownFormat {}

/// Error raised while encoding or decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value could not be serialized.
    Encode {
        format: SerializationFormat,
        message: String,
    },
    /// The bytes did not match the expected schema.
    Decode {
        format: SerializationFormat,
        message: String,
    },
    /// A text payload was handed to a binary format or vice versa.
    KindMismatch {
        format: SerializationFormat,
        expected: PayloadKind,
        found: PayloadKind,
    },
}

impl CodecError {
    fn encode(format: SerializationFormat, err: impl fmt::Display) -> Self {
        CodecError::Encode {
            format,
            message: err.to_string(),
        }
    }

    fn decode(format: SerializationFormat, err: impl fmt::Display) -> Self {
        CodecError::Decode {
            format,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode { format, message } => {
                write!(f, "{format} encode error: {message}")
            }
            CodecError::Decode { format, message } => {
                write!(f, "{format} decode error: {message}")
            }
            CodecError::KindMismatch {
                format,
                expected,
                found,
            } => write!(
                f,
                "{format} expects a {expected} payload, got a {found} payload"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Codec trait for message serialization.
///
/// Implementations provide encoding/decoding for one serialization format.
pub trait Codec {
    /// The format this codec implements.
    const FORMAT: SerializationFormat;

    /// Error type returned by encode operations.
    type EncodeError: std::error::Error;

    /// Error type returned by decode operations.
    type DecodeError: std::error::Error;

    /// Encode a value into bytes.
    fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Postcard codec: compact, deterministic binary encoding.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const FORMAT: SerializationFormat = SerializationFormat::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// JSON codec using serde_json.
///
/// Larger and slower than postcard, but payloads can be read by humans and
/// external tools.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const FORMAT: SerializationFormat = SerializationFormat::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMessage {
        id: u32,
        name: String,
        nickname: Option<String>,
        tags: Vec<String>,
        nested: Option<Box<TestMessage>>,
    }

    fn sample() -> TestMessage {
        TestMessage {
            id: 42,
            name: "test".to_string(),
            nickname: None,
            tags: vec!["a".into(), "b".into()],
            nested: Some(Box::new(TestMessage {
                id: 7,
                name: "inner".into(),
                nickname: Some("in".into()),
                tags: vec![],
                nested: None,
            })),
        }
    }

    #[test]
    fn format_try_from_u8() {
        assert_eq!(SerializationFormat::try_from(1).unwrap(), SerializationFormat::Postcard);
        assert_eq!(SerializationFormat::try_from(2).unwrap(), SerializationFormat::Json);
        assert_eq!(SerializationFormat::try_from(0), Err(UnknownFormat(0)));
        assert_eq!(SerializationFormat::try_from(99), Err(UnknownFormat(99)));
    }

    #[test]
    fn format_display() {
        assert_eq!(SerializationFormat::Postcard.to_string(), "postcard");
        assert_eq!(SerializationFormat::Json.to_string(), "json");
        assert!(UnknownFormat(42).to_string().contains("42"));
    }

    #[test]
    fn formats_roundtrip_nested_and_optional_values() {
        for format in SerializationFormat::ALL {
            let payload = format.serialize(&sample()).unwrap();
            assert_eq!(payload.kind(), format.payload_kind());
            let decoded: TestMessage = format.deserialize(&payload).unwrap();
            assert_eq!(decoded, sample());

            let none: Option<u64> = None;
            let payload = format.serialize(&none).unwrap();
            assert_eq!(format.deserialize::<Option<u64>>(&payload).unwrap(), None);

            let mut map = BTreeMap::new();
            map.insert("theme".to_string(), vec![1u8, 2, 3]);
            let payload = format.serialize(&map).unwrap();
            assert_eq!(
                format.deserialize::<BTreeMap<String, Vec<u8>>>(&payload).unwrap(),
                map
            );
        }
    }

    #[test]
    fn unit_roundtrips() {
        for format in SerializationFormat::ALL {
            let payload = format.serialize(&()).unwrap();
            format.deserialize::<()>(&payload).unwrap();
        }
    }

    #[test]
    fn postcard_rejects_garbage() {
        let bad = SerializedPayload::Binary(vec![0xFF, 0xFF, 0xFF]);
        let err = SerializationFormat::Postcard
            .deserialize::<TestMessage>(&bad)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn json_rejects_garbage() {
        let bad = SerializedPayload::Text("not valid json {".into());
        let err = SerializationFormat::Json
            .deserialize::<TestMessage>(&bad)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn payload_kind_mismatch_is_an_error() {
        let text = SerializedPayload::Text("1".into());
        let err = SerializationFormat::Postcard.deserialize::<u32>(&text).unwrap_err();
        assert_eq!(
            err,
            CodecError::KindMismatch {
                format: SerializationFormat::Postcard,
                expected: PayloadKind::Binary,
                found: PayloadKind::Text,
            }
        );
    }

    #[test]
    fn json_is_human_readable() {
        let bytes = SerializationFormat::Json.encode_bytes(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("42"));
        assert!(text.contains("inner"));
    }

    #[test]
    fn postcard_vs_json_size() {
        let postcard = PostcardCodec::encode(&sample()).unwrap();
        let json = JsonCodec::encode(&sample()).unwrap();
        assert!(postcard.len() < json.len());
    }
}
