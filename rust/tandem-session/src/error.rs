use std::fmt;

use tandem_wire::{CodecError, RpcError};

#[derive(Debug)]
pub enum SessionError {
    /// The transaction was still rejected after every retry.
    TransactionFailed { attempts: u32 },
    /// The session call to the peer failed.
    Rpc(RpcError),
    /// A context value could not be encoded or decoded.
    Codec(CodecError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TransactionFailed { attempts } => {
                write!(f, "context transaction rejected {attempts} times")
            }
            SessionError::Rpc(e) => write!(f, "session call failed: {e}"),
            SessionError::Codec(e) => write!(f, "context value: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::TransactionFailed { .. } => None,
            SessionError::Rpc(e) => Some(e),
            SessionError::Codec(e) => Some(e),
        }
    }
}

impl From<RpcError> for SessionError {
    fn from(e: RpcError) -> Self {
        SessionError::Rpc(e)
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e)
    }
}
