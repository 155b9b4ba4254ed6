//! Frame model.
//!
//! A frame is a header (call reference + event tag) plus an opaque payload.
//! Events sent by the caller of a call are [`UpstreamEvent`]s, events sent by
//! the callee are [`DownstreamEvent`]s. The direction also tells which stream
//! of the call a [`StreamPart`] belongs to:
//!
//! | sent by | `Operation(..)` concerns | `Event(..)` concerns |
//! |---------|--------------------------|----------------------|
//! | caller  | downstream stream        | upstream stream      |
//! | callee  | upstream stream          | downstream stream    |

use serde::{Deserialize, Serialize};
use std::fmt;

use tandem_codec::{CodecError, SerializationFormat, SerializedPayload};

use crate::{CallRef, CallShape, ServiceCallId};

/// Control operation sent by the consumer of a cold stream to its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamOperation {
    /// The consumer is collecting: the producer may start forwarding.
    Start,
    /// The consumer stopped collecting: the producer must stop forwarding.
    Close,
    /// The consumer can take this many more elements.
    ///
    /// A started producer sends an element only against credit; the
    /// consumer grants its window after `Start` and replenishes it as the
    /// application takes elements.
    Credit(u32),
}

/// Stream event tag sent by the producer of a cold stream to its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamSignal {
    /// One element; the payload is the serialized element.
    Element,
    /// The stream finished normally.
    Complete,
    /// The stream failed; the payload is an `RpcError`.
    Error,
    /// The stream was never started and the producer gave up on it.
    Timeout,
}

impl StreamSignal {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamSignal::Element)
    }
}

/// Stream traffic of a call, either a control operation or an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamPart {
    Operation(StreamOperation),
    Event(StreamSignal),
}

/// Events sent by the caller of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamEvent {
    /// Opens the call; the payload is the request.
    Open { call: ServiceCallId, shape: CallShape },
    Data(StreamPart),
    /// The caller failed the call; the payload is an `RpcError`.
    Error,
    /// The caller cancelled the call.
    Close,
}

/// Events sent by the callee of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownstreamEvent {
    /// The handler produced a downstream stream and offers it to the caller.
    Opened,
    Data(StreamPart),
    /// Successful single response; the payload is the value.
    Response,
    /// The callee released the call.
    Close,
    /// Non-fatal diagnostic; the payload is a text message.
    Warning,
    /// Terminal failure; the payload is an `RpcError`.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Upstream(UpstreamEvent),
    Downstream(DownstreamEvent),
}

impl From<UpstreamEvent> for Event {
    fn from(event: UpstreamEvent) -> Self {
        Event::Upstream(event)
    }
}

impl From<DownstreamEvent> for Event {
    fn from(event: DownstreamEvent) -> Self {
        Event::Downstream(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub call_ref: CallRef,
    pub event: Event,
}

/// One unit on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub header: Header,
    pub payload: SerializedPayload,
}

impl Frame {
    pub fn new(call_ref: CallRef, event: impl Into<Event>, payload: SerializedPayload) -> Self {
        Self {
            header: Header {
                call_ref,
                event: event.into(),
            },
            payload,
        }
    }

    /// A frame whose payload carries nothing.
    pub fn bare(call_ref: CallRef, event: impl Into<Event>, format: SerializationFormat) -> Self {
        Self::new(call_ref, event, SerializedPayload::empty(format))
    }

    pub fn call_ref(&self) -> CallRef {
        self.header.call_ref
    }

    pub fn event(&self) -> &Event {
        &self.header.event
    }

    /// Encode the whole frame into one connection message.
    pub fn encode(&self, format: SerializationFormat) -> Result<Vec<u8>, CodecError> {
        format.encode_bytes(self)
    }

    /// Decode one connection message into a frame.
    ///
    /// Only the header is interpreted; the payload stays opaque.
    pub fn decode(format: SerializationFormat, bytes: &[u8]) -> Result<Self, CodecError> {
        format.decode_bytes(bytes)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("call_ref", &self.header.call_ref)
            .field("event", &self.header.event)
            .field("payload", &self.payload)
            .finish()
    }
}
