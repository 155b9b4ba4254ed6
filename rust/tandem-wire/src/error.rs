use serde::{Deserialize, Serialize};
use std::fmt;

use tandem_codec::CodecError;

use crate::ServiceCallId;

/// Status code carried by every [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// A frame arrived in a state where it is not allowed.
    ProtocolViolation,
    /// The callee has no call registered under the requested identifier.
    NotFound,
    /// A stream was offered but never started within the window.
    StreamTimeout,
    /// A payload could not be encoded or decoded.
    Serialization,
    /// The callee's handler failed.
    Application,
    /// The call was cancelled by one of the peers.
    Cancelled,
    /// The connection ended before the call did.
    ConnectionClosed,
    /// Anything else, including handler panics.
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::ProtocolViolation => "protocol violation",
            StatusCode::NotFound => "not found",
            StatusCode::StreamTimeout => "stream timeout",
            StatusCode::Serialization => "serialization error",
            StatusCode::Application => "application error",
            StatusCode::Cancelled => "cancelled",
            StatusCode::ConnectionClosed => "connection closed",
            StatusCode::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Error envelope of a call.
///
/// This is the only error type that crosses the wire: application failures
/// are wrapped into it at the callee boundary, and every call either resolves
/// with a value or with one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

impl RpcError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProtocolViolation, message)
    }

    pub fn not_found(call: &ServiceCallId) -> Self {
        Self::new(StatusCode::NotFound, format!("no call registered as {call}"))
    }

    pub fn stream_timeout() -> Self {
        Self::new(
            StatusCode::StreamTimeout,
            "stream was not started within the timeout",
        )
    }

    pub fn serialization(err: impl fmt::Display) -> Self {
        Self::new(StatusCode::Serialization, err.to_string())
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Application, message)
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "call was cancelled")
    }

    pub fn connection_closed() -> Self {
        Self::new(StatusCode::ConnectionClosed, "connection closed")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == StatusCode::StreamTimeout
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::serialization(err)
    }
}
