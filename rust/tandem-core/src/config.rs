use std::fmt;
use std::time::Duration;

use tandem_wire::{HANDSHAKE_VERSION, ProtocolVersion, SerializationFormat};

/// Side of a connection during the handshake.
///
/// The server speaks first and proposes; the client picks. After the
/// handshake both sides are symmetric peers, except where an extension
/// chooses to treat one of them as the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Configuration for the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Magic version byte. Both sides must use the same value.
    pub version: u8,
    /// Supported serialization formats, most preferred first.
    pub formats: Vec<SerializationFormat>,
    /// Supported protocol versions, most preferred first.
    pub protocol_versions: Vec<ProtocolVersion>,
    /// Extensions this side would like to enable.
    ///
    /// Filled in by the node builder from its registered extensions.
    pub extensions: Vec<String>,
    /// Limit for waiting on any single handshake message.
    pub stage_timeout: Duration,
    /// Limit for the whole handshake.
    pub total_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version: HANDSHAKE_VERSION,
            formats: SerializationFormat::ALL.to_vec(),
            protocol_versions: vec![ProtocolVersion::V1],
            extensions: Vec::new(),
            stage_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(300),
        }
    }
}

impl HandshakeConfig {
    pub fn with_formats(mut self, formats: impl IntoIterator<Item = SerializationFormat>) -> Self {
        self.formats = formats.into_iter().collect();
        self
    }

    pub fn with_timeouts(mut self, stage: Duration, total: Duration) -> Self {
        self.stage_timeout = stage;
        self.total_timeout = total;
        self
    }
}

/// Per-node settings that apply after the handshake.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long an offered cold stream waits for the consumer to start it.
    pub stream_start_timeout: Duration,
    /// Elements buffered between the node and a stream consumer.
    pub stream_buffer: usize,
    /// Credit a consumer grants its producer: the most elements that may be
    /// in flight toward this side per stream, beyond `stream_buffer`.
    pub stream_window: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            stream_start_timeout: Duration::from_secs(60),
            stream_buffer: 1,
            stream_window: 16,
        }
    }
}
