//! Pending calls.
//!
//! Every call in flight is driven by one task per side. The task owns the
//! call's state, receives the call's frames through a mailbox filled by the
//! node's receive loop, and sends frames for the call on the connection.
//! Each stream direction of a call is either an [`Outbound`] (this side
//! produces) or an [`Inbound`] (this side consumes).

use std::future::Future;
use std::sync::Arc;

use tandem_wire::{
    CallRef, DownstreamEvent, Event, Frame, RpcError, SerializedPayload, StreamEvent,
    StreamOperation, StreamPart, StreamSignal, UpstreamEvent,
};
use tracing::debug;

use crate::node::NodeShared;

pub(crate) mod callee;
pub(crate) mod caller;
mod inbound;
mod outbound;

pub(crate) use inbound::{Inbound, InboundProgress};
pub(crate) use outbound::{Outbound, OutboundProgress};

/// Which end of a call a task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Side {
    Caller,
    Callee,
}

/// Sends frames for one call, in the direction of its side.
#[derive(Clone)]
pub(crate) struct CallLink {
    pub(crate) shared: Arc<NodeShared>,
    side: Side,
    call_ref: CallRef,
}

impl CallLink {
    pub(crate) fn new(shared: Arc<NodeShared>, side: Side, call_ref: CallRef) -> Self {
        Self {
            shared,
            side,
            call_ref,
        }
    }

    fn empty(&self) -> SerializedPayload {
        SerializedPayload::empty(self.shared.format())
    }

    /// Send one frame of this call. Returns whether it was written.
    pub(crate) async fn send(&self, event: impl Into<Event>, payload: SerializedPayload) -> bool {
        let frame = Frame::new(self.call_ref, event, payload);
        match self.shared.send_frame(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(call_ref = %self.call_ref, error = %e, "could not send frame");
                false
            }
        }
    }

    async fn stream_part(&self, part: StreamPart, payload: SerializedPayload) -> bool {
        match self.side {
            Side::Caller => self.send(UpstreamEvent::Data(part), payload).await,
            Side::Callee => self.send(DownstreamEvent::Data(part), payload).await,
        }
    }

    /// Event for the stream this side produces.
    pub(crate) async fn signal(&self, signal: StreamSignal, payload: SerializedPayload) -> bool {
        self.stream_part(StreamPart::Event(signal), payload).await
    }

    /// Operation for the stream this side consumes.
    pub(crate) async fn operation(&self, operation: StreamOperation) -> bool {
        self.stream_part(StreamPart::Operation(operation), self.empty())
            .await
    }

    /// Fail the whole call.
    pub(crate) async fn error(&self, err: &RpcError) -> bool {
        let payload = self.shared.error_payload(err);
        match self.side {
            Side::Caller => self.send(UpstreamEvent::Error, payload).await,
            Side::Callee => self.send(DownstreamEvent::Error, payload).await,
        }
    }

    /// Release the whole call.
    pub(crate) async fn close(&self) -> bool {
        match self.side {
            Side::Caller => self.send(UpstreamEvent::Close, self.empty()).await,
            Side::Callee => self.send(DownstreamEvent::Close, self.empty()).await,
        }
    }
}

/// Removes a call's mailbox from the routing table when the call's task ends.
pub(crate) struct RouteGuard {
    shared: Arc<NodeShared>,
    side: Side,
    call_ref: CallRef,
    /// The peer ended the call itself; nothing more may follow.
    pub(crate) answered: bool,
}

impl RouteGuard {
    pub(crate) fn new(shared: Arc<NodeShared>, side: Side, call_ref: CallRef) -> Self {
        Self {
            shared,
            side,
            call_ref,
            answered: false,
        }
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.shared.unroute(self.side, self.call_ref, self.answered);
    }
}

/// Turn a received stream signal into the event handed to a consumer.
pub(crate) fn stream_event(
    shared: &NodeShared,
    signal: StreamSignal,
    payload: SerializedPayload,
) -> StreamEvent<SerializedPayload> {
    match signal {
        StreamSignal::Element => StreamEvent::Element(payload),
        StreamSignal::Complete => StreamEvent::Complete,
        StreamSignal::Error => StreamEvent::Error(shared.decode_error(&payload)),
        StreamSignal::Timeout => StreamEvent::Error(RpcError::stream_timeout()),
    }
}

/// Await an optional future; pending forever when there is none.
pub(crate) async fn maybe<F: Future + Unpin>(fut: Option<&mut F>) -> F::Output {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
