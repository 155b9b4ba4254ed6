//! Untyped view of a call, as seen by interceptors and the node.

use std::fmt;

use tandem_wire::{CallRef, CallShape, RpcError, SerializedPayload, ServiceCallId};

use crate::stream::PayloadStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// Issued by this node.
    Outgoing,
    /// Issued by the peer and served by this node.
    Incoming,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallDirection::Outgoing => write!(f, "outgoing"),
            CallDirection::Incoming => write!(f, "incoming"),
        }
    }
}

/// Identity of a call travelling through an interceptor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub call: ServiceCallId,
    pub shape: CallShape,
    pub direction: CallDirection,
    /// The peer's reference, for incoming calls. Outgoing calls get theirs
    /// only once they reach the connection.
    pub call_ref: Option<CallRef>,
}

impl CallInfo {
    pub fn outgoing(call: ServiceCallId, shape: CallShape) -> Self {
        Self {
            call,
            shape,
            direction: CallDirection::Outgoing,
            call_ref: None,
        }
    }

    pub fn incoming(call: ServiceCallId, shape: CallShape, call_ref: CallRef) -> Self {
        Self {
            call,
            shape,
            direction: CallDirection::Incoming,
            call_ref: Some(call_ref),
        }
    }
}

/// Request side of a call.
pub enum CallInput {
    Single(SerializedPayload),
    ColdUpstream {
        request: SerializedPayload,
        upstream: PayloadStream,
    },
    ColdDownstream(SerializedPayload),
    ColdBistream {
        request: SerializedPayload,
        upstream: PayloadStream,
    },
}

impl CallInput {
    /// Pair a request with an optional upstream according to `shape`.
    ///
    /// Returns `None` when the upstream does not match the shape.
    pub fn new(
        shape: CallShape,
        request: SerializedPayload,
        upstream: Option<PayloadStream>,
    ) -> Option<Self> {
        match (shape, upstream) {
            (CallShape::Single, None) => Some(CallInput::Single(request)),
            (CallShape::ColdDownstream, None) => Some(CallInput::ColdDownstream(request)),
            (CallShape::ColdUpstream, Some(upstream)) => {
                Some(CallInput::ColdUpstream { request, upstream })
            }
            (CallShape::ColdBistream, Some(upstream)) => {
                Some(CallInput::ColdBistream { request, upstream })
            }
            _ => None,
        }
    }

    pub fn shape(&self) -> CallShape {
        match self {
            CallInput::Single(_) => CallShape::Single,
            CallInput::ColdUpstream { .. } => CallShape::ColdUpstream,
            CallInput::ColdDownstream(_) => CallShape::ColdDownstream,
            CallInput::ColdBistream { .. } => CallShape::ColdBistream,
        }
    }

    pub fn request(&self) -> &SerializedPayload {
        match self {
            CallInput::Single(request)
            | CallInput::ColdDownstream(request)
            | CallInput::ColdUpstream { request, .. }
            | CallInput::ColdBistream { request, .. } => request,
        }
    }

    /// Split into the request and the upstream, if any.
    pub fn into_parts(self) -> (SerializedPayload, Option<PayloadStream>) {
        match self {
            CallInput::Single(request) | CallInput::ColdDownstream(request) => (request, None),
            CallInput::ColdUpstream { request, upstream }
            | CallInput::ColdBistream { request, upstream } => (request, Some(upstream)),
        }
    }

    /// Rebuild with a transformed upstream.
    pub fn map_upstream(self, f: impl FnOnce(PayloadStream) -> PayloadStream) -> Self {
        match self {
            CallInput::ColdUpstream { request, upstream } => CallInput::ColdUpstream {
                request,
                upstream: f(upstream),
            },
            CallInput::ColdBistream { request, upstream } => CallInput::ColdBistream {
                request,
                upstream: f(upstream),
            },
            other => other,
        }
    }
}

impl fmt::Debug for CallInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInput")
            .field("shape", &self.shape())
            .field("request", self.request())
            .finish_non_exhaustive()
    }
}

/// Result side of a call.
pub enum CallOutput {
    /// Single response, for single and upstream calls.
    Response(SerializedPayload),
    /// Downstream, for downstream and bistream calls.
    Stream(PayloadStream),
}

impl CallOutput {
    pub fn into_response(self) -> Result<SerializedPayload, RpcError> {
        match self {
            CallOutput::Response(payload) => Ok(payload),
            CallOutput::Stream(_) => Err(RpcError::internal(
                "call produced a stream where a response was expected",
            )),
        }
    }

    pub fn into_stream(self) -> Result<PayloadStream, RpcError> {
        match self {
            CallOutput::Stream(stream) => Ok(stream),
            CallOutput::Response(_) => Err(RpcError::internal(
                "call produced a response where a stream was expected",
            )),
        }
    }

    /// Whether this output fits a call of `shape`.
    pub fn fits(&self, shape: CallShape) -> bool {
        match self {
            CallOutput::Response(_) => shape.has_response(),
            CallOutput::Stream(_) => shape.has_downstream(),
        }
    }
}

impl fmt::Debug for CallOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutput::Response(payload) => f.debug_tuple("Response").field(payload).finish(),
            CallOutput::Stream(_) => f.debug_tuple("Stream").finish_non_exhaustive(),
        }
    }
}
