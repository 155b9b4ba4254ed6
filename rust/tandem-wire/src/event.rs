use serde::{Deserialize, Serialize};

use crate::RpcError;

/// One unit of information flowing over a cold stream.
///
/// Used identically for the caller-to-callee and callee-to-caller legs.
/// A stream delivers any number of elements followed by exactly one of
/// `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent<T> {
    Element(T),
    Complete,
    Error(RpcError),
}

impl<T> StreamEvent<T> {
    /// Whether no further event may follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Element(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StreamEvent<U> {
        match self {
            StreamEvent::Element(value) => StreamEvent::Element(f(value)),
            StreamEvent::Complete => StreamEvent::Complete,
            StreamEvent::Error(err) => StreamEvent::Error(err),
        }
    }
}

/// Terminal outcome of a single call or of the final leg of an upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response<T> {
    Success(T),
    Error(RpcError),
}

impl<T> Response<T> {
    pub fn into_result(self) -> Result<T, RpcError> {
        match self {
            Response::Success(value) => Ok(value),
            Response::Error(err) => Err(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

impl<T> From<Result<T, RpcError>> for Response<T> {
    fn from(result: Result<T, RpcError>) -> Self {
        match result {
            Ok(value) => Response::Success(value),
            Err(err) => Response::Error(err),
        }
    }
}
