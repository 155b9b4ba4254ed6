//! Connection handshake.
//!
//! Runs once per connection before any frame is exchanged. The server
//! announces the handshake version and its formats, the client picks a
//! format, then both agree on a protocol version and a set of extensions
//! using messages encoded with the chosen format.

use std::fmt;

use tandem_wire::{
    HandshakeCompletion, NO_COMMON_FORMAT, ProtocolAnswer, ProtocolOffer, ProtocolVersion,
    SerializationFormat, decode_format_list, encode_format_list,
};
use tracing::{debug, warn};

use crate::config::{HandshakeConfig, Role};
use crate::connection::{Connection, ConnectionError};

/// Result of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub role: Role,
    pub format: SerializationFormat,
    pub protocol: ProtocolVersion,
    /// Extensions enabled on both sides, in the server's order.
    pub extensions: Vec<String>,
}

impl Negotiated {
    pub fn has_extension(&self, id: &str) -> bool {
        self.extensions.iter().any(|e| e == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Version,
    Formats,
    FormatChoice,
    ProtocolOffer,
    ProtocolAnswer,
    Completion,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeStage::Version => "version",
            HandshakeStage::Formats => "format list",
            HandshakeStage::FormatChoice => "format choice",
            HandshakeStage::ProtocolOffer => "protocol offer",
            HandshakeStage::ProtocolAnswer => "protocol answer",
            HandshakeStage::Completion => "completion",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum HandshakeError {
    VersionMismatch {
        expected: u8,
        found: Vec<u8>,
    },
    /// No format is supported by both sides. Lists are format ids.
    NoCommonFormat {
        server: Vec<u8>,
        client: Vec<u8>,
    },
    /// The client picked a format the server never offered.
    UnexpectedFormat(u8),
    NoCommonProtocol {
        server: Vec<ProtocolVersion>,
        client: Vec<ProtocolVersion>,
    },
    /// The client picked a protocol version the server never offered.
    UnexpectedProtocol(ProtocolVersion),
    /// The client enabled an extension the server never offered.
    UnexpectedExtension(String),
    /// The server refused the client's answer.
    Rejected {
        reason: String,
    },
    Malformed {
        stage: HandshakeStage,
        message: String,
    },
    StageTimeout(HandshakeStage),
    TotalTimeout,
    Connection(ConnectionError),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::VersionMismatch { expected, found } => {
                write!(f, "handshake version mismatch: expected {expected:#04x}, got {found:?}")
            }
            HandshakeError::NoCommonFormat { server, client } => write!(
                f,
                "no common serialization format (server offers {server:?}, client supports {client:?})"
            ),
            HandshakeError::UnexpectedFormat(id) => {
                write!(f, "client chose format {id} which was not offered")
            }
            HandshakeError::NoCommonProtocol { server, client } => write!(
                f,
                "no common protocol version (server offers {server:?}, client supports {client:?})"
            ),
            HandshakeError::UnexpectedProtocol(v) => {
                write!(f, "client chose protocol {v} which was not offered")
            }
            HandshakeError::UnexpectedExtension(id) => {
                write!(f, "client enabled extension {id:?} which was not offered")
            }
            HandshakeError::Rejected { reason } => write!(f, "handshake rejected: {reason}"),
            HandshakeError::Malformed { stage, message } => {
                write!(f, "malformed {stage} message: {message}")
            }
            HandshakeError::StageTimeout(stage) => write!(f, "timed out waiting for {stage}"),
            HandshakeError::TotalTimeout => write!(f, "handshake did not finish in time"),
            HandshakeError::Connection(e) => write!(f, "connection failed during handshake: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for HandshakeError {
    fn from(e: ConnectionError) -> Self {
        HandshakeError::Connection(e)
    }
}

/// Run the handshake for one side of a connection.
///
/// The connection is left open either way; callers close it on failure.
pub async fn handshake(
    connection: &Connection,
    role: Role,
    config: &HandshakeConfig,
) -> Result<Negotiated, HandshakeError> {
    let run = async {
        match role {
            Role::Server => run_server(connection, config).await,
            Role::Client => run_client(connection, config).await,
        }
    };
    let negotiated = tokio::time::timeout(config.total_timeout, run)
        .await
        .map_err(|_| HandshakeError::TotalTimeout)??;

    for ext in &config.extensions {
        if !negotiated.has_extension(ext) {
            warn!(extension = %ext, "peer does not support extension, disabled");
        }
    }
    debug!(
        %role,
        format = %negotiated.format,
        protocol = %negotiated.protocol,
        extensions = ?negotiated.extensions,
        "handshake complete"
    );
    Ok(negotiated)
}

async fn receive(
    connection: &Connection,
    stage: HandshakeStage,
    config: &HandshakeConfig,
) -> Result<Vec<u8>, HandshakeError> {
    tokio::time::timeout(config.stage_timeout, connection.receive())
        .await
        .map_err(|_| HandshakeError::StageTimeout(stage))?
        .map_err(HandshakeError::Connection)
}

fn decode<T: serde::de::DeserializeOwned>(
    format: SerializationFormat,
    stage: HandshakeStage,
    bytes: &[u8],
) -> Result<T, HandshakeError> {
    format
        .decode_bytes(bytes)
        .map_err(|e| HandshakeError::Malformed {
            stage,
            message: e.to_string(),
        })
}

fn encode<T: serde::Serialize>(
    format: SerializationFormat,
    stage: HandshakeStage,
    value: &T,
) -> Result<Vec<u8>, HandshakeError> {
    format
        .encode_bytes(value)
        .map_err(|e| HandshakeError::Malformed {
            stage,
            message: e.to_string(),
        })
}

async fn run_server(
    connection: &Connection,
    config: &HandshakeConfig,
) -> Result<Negotiated, HandshakeError> {
    let offered: Vec<u8> = config.formats.iter().map(|f| f.id()).collect();

    connection.send(vec![config.version]).await?;
    connection.send(encode_format_list(&offered)).await?;

    let choice = receive(connection, HandshakeStage::FormatChoice, config).await?;
    let Some((&chosen, rest)) = choice.split_first() else {
        return Err(HandshakeError::Malformed {
            stage: HandshakeStage::FormatChoice,
            message: "empty format choice".to_string(),
        });
    };
    if chosen == NO_COMMON_FORMAT {
        return Err(HandshakeError::NoCommonFormat {
            server: offered,
            client: decode_format_list(rest).unwrap_or_default(),
        });
    }
    let format = SerializationFormat::try_from(chosen)
        .ok()
        .filter(|f| config.formats.contains(f))
        .ok_or(HandshakeError::UnexpectedFormat(chosen))?;

    let offer = ProtocolOffer {
        versions: config.protocol_versions.clone(),
        extensions: config.extensions.clone(),
    };
    connection
        .send(encode(format, HandshakeStage::ProtocolOffer, &offer)?)
        .await?;

    let answer = receive(connection, HandshakeStage::ProtocolAnswer, config).await?;
    let answer: ProtocolAnswer = decode(format, HandshakeStage::ProtocolAnswer, &answer)?;

    let failure = match answer {
        ProtocolAnswer::Unsupported { versions } => HandshakeError::NoCommonProtocol {
            server: offer.versions,
            client: versions,
        },
        ProtocolAnswer::Selected {
            version,
            extensions,
        } => {
            if !offer.versions.contains(&version) {
                HandshakeError::UnexpectedProtocol(version)
            } else if let Some(ext) = extensions.iter().find(|e| !offer.extensions.contains(e)) {
                HandshakeError::UnexpectedExtension(ext.clone())
            } else {
                let done = HandshakeCompletion::Completed;
                connection
                    .send(encode(format, HandshakeStage::Completion, &done)?)
                    .await?;
                return Ok(Negotiated {
                    role: Role::Server,
                    format,
                    protocol: version,
                    extensions,
                });
            }
        }
    };

    let failed = HandshakeCompletion::Failed {
        reason: failure.to_string(),
    };
    if let Ok(bytes) = encode(format, HandshakeStage::Completion, &failed) {
        let _ = connection.send(bytes).await;
    }
    Err(failure)
}

async fn run_client(
    connection: &Connection,
    config: &HandshakeConfig,
) -> Result<Negotiated, HandshakeError> {
    let version = receive(connection, HandshakeStage::Version, config).await?;
    if version != [config.version] {
        return Err(HandshakeError::VersionMismatch {
            expected: config.version,
            found: version,
        });
    }

    let list = receive(connection, HandshakeStage::Formats, config).await?;
    let offered = decode_format_list(&list).ok_or_else(|| HandshakeError::Malformed {
        stage: HandshakeStage::Formats,
        message: "format list length does not match its prefix".to_string(),
    })?;
    let supported: Vec<u8> = config.formats.iter().map(|f| f.id()).collect();

    let Some(chosen) = offered.iter().copied().find(|id| supported.contains(id)) else {
        let mut answer = vec![NO_COMMON_FORMAT];
        answer.extend(encode_format_list(&supported));
        let _ = connection.send(answer).await;
        return Err(HandshakeError::NoCommonFormat {
            server: offered,
            client: supported,
        });
    };
    let format = SerializationFormat::try_from(chosen)
        .map_err(|_| HandshakeError::UnexpectedFormat(chosen))?;
    connection.send(vec![chosen]).await?;

    let offer = receive(connection, HandshakeStage::ProtocolOffer, config).await?;
    let offer: ProtocolOffer = decode(format, HandshakeStage::ProtocolOffer, &offer)?;

    let Some(version) = offer
        .versions
        .iter()
        .filter(|v| config.protocol_versions.contains(v))
        .max()
        .copied()
    else {
        let answer = ProtocolAnswer::Unsupported {
            versions: config.protocol_versions.clone(),
        };
        if let Ok(bytes) = encode(format, HandshakeStage::ProtocolAnswer, &answer) {
            let _ = connection.send(bytes).await;
        }
        return Err(HandshakeError::NoCommonProtocol {
            server: offer.versions,
            client: config.protocol_versions.clone(),
        });
    };

    let extensions: Vec<String> = offer
        .extensions
        .iter()
        .filter(|e| config.extensions.contains(e))
        .cloned()
        .collect();
    let answer = ProtocolAnswer::Selected {
        version,
        extensions: extensions.clone(),
    };
    connection
        .send(encode(format, HandshakeStage::ProtocolAnswer, &answer)?)
        .await?;

    let completion = receive(connection, HandshakeStage::Completion, config).await?;
    match decode(format, HandshakeStage::Completion, &completion)? {
        HandshakeCompletion::Completed => Ok(Negotiated {
            role: Role::Client,
            format,
            protocol: version,
            extensions,
        }),
        HandshakeCompletion::Failed { reason } => Err(HandshakeError::Rejected { reason }),
    }
}
