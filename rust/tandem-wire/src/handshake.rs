//! Handshake messages.
//!
//! The sequence is:
//!
//! 1. server -> client: `[HANDSHAKE_VERSION]`
//! 2. server -> client: supported format ids, `[n, id_1 .. id_n]` in preference order
//! 3. client -> server: `[chosen id]`, or `[NO_COMMON_FORMAT]`
//! 4. server -> client: [`ProtocolOffer`] (encoded with the chosen format)
//! 5. client -> server: [`ProtocolAnswer`]
//! 6. server -> client: [`HandshakeCompletion`]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic byte asserting both peers speak the same handshake.
pub const HANDSHAKE_VERSION: u8 = 0x74;

/// Format id a client answers with when no advertised format is acceptable.
pub const NO_COMMON_FORMAT: u8 = 0;

/// Version of the RPC protocol spoken after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    pub const V1: ProtocolVersion = ProtocolVersion(1);
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Server's offer of protocol versions (preference order) and extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolOffer {
    pub versions: Vec<ProtocolVersion>,
    pub extensions: Vec<String>,
}

/// Client's answer to a [`ProtocolOffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolAnswer {
    Selected {
        version: ProtocolVersion,
        extensions: Vec<String>,
    },
    /// None of the offered versions is supported; lists the client's own.
    Unsupported { versions: Vec<ProtocolVersion> },
}

/// Final handshake frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeCompletion {
    Completed,
    Failed { reason: String },
}

/// Encode a list of format ids as a length-prefixed byte array.
pub fn encode_format_list(ids: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ids.len() + 1);
    out.push(ids.len() as u8);
    out.extend_from_slice(ids);
    out
}

/// Decode a length-prefixed format id list.
///
/// Returns `None` when the length prefix does not match the data.
pub fn decode_format_list(bytes: &[u8]) -> Option<Vec<u8>> {
    let (&len, ids) = bytes.split_first()?;
    (ids.len() == len as usize).then(|| ids.to_vec())
}
