use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SerializationFormat;

/// Kind of data a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Binary,
    Text,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Binary => write!(f, "binary"),
            PayloadKind::Text => write!(f, "text"),
        }
    }
}

/// An opaque, already-serialized value.
///
/// Payloads are carried next to frame headers and only decoded once the
/// receiving state machine knows which type to expect.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializedPayload {
    Binary(Vec<u8>),
    Text(String),
}

impl SerializedPayload {
    /// An empty payload of the kind `format` produces.
    pub fn empty(format: SerializationFormat) -> Self {
        if format.is_binary() {
            SerializedPayload::Binary(Vec::new())
        } else {
            SerializedPayload::Text(String::new())
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            SerializedPayload::Binary(_) => PayloadKind::Binary,
            SerializedPayload::Text(_) => PayloadKind::Text,
        }
    }

    /// Raw bytes of the payload (UTF-8 for text payloads).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SerializedPayload::Binary(bytes) => bytes,
            SerializedPayload::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SerializedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializedPayload::Binary(bytes) => {
                write!(f, "Binary({} bytes)", bytes.len())
            }
            SerializedPayload::Text(text) if text.len() <= 64 => write!(f, "Text({text:?})"),
            SerializedPayload::Text(text) => write!(f, "Text({} chars)", text.len()),
        }
    }
}
