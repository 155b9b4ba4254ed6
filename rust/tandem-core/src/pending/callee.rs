//! Callee side of a call: runs the handler and serves its streams.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tandem_wire::{
    CallRef, CallShape, DownstreamEvent, Event, Frame, RpcError, SerializedPayload,
    ServiceCallId, StreamOperation, StreamPart, UpstreamEvent,
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, debug_span, trace, warn};

use super::{
    CallLink, Inbound, InboundProgress, Outbound, RouteGuard, Side, maybe, stream_event,
};
use crate::call::{CallInfo, CallInput, CallOutput};
use crate::node::NodeShared;
use crate::stream::{PayloadStream, cold_stream};

struct CalleeTask {
    link: CallLink,
    info: CallInfo,
    mailbox: mpsc::UnboundedReceiver<Frame>,
    handler: Option<BoxFuture<'static, Result<CallOutput, RpcError>>>,
    /// A single response went out; the caller has let go of its upstream.
    responded: bool,
    upstream: Inbound,
    downstream: Outbound,
    _route: RouteGuard,
}

/// Start serving a call the peer just opened.
///
/// The mailbox must already be registered under `call_ref`.
pub(crate) fn spawn(
    shared: &Arc<NodeShared>,
    call_ref: CallRef,
    call: ServiceCallId,
    shape: CallShape,
    request: SerializedPayload,
    mailbox: mpsc::UnboundedReceiver<Frame>,
) {
    let span = debug_span!(parent: &shared.span, "callee", call = %call, %call_ref, %shape);
    let route = RouteGuard::new(shared.clone(), Side::Callee, call_ref);
    let info = CallInfo::incoming(call, shape, call_ref);

    let (upstream, upstream_stream) = if shape.has_upstream() {
        let (sink, stream) = cold_stream(shared.config.stream_buffer);
        let inbound = Inbound::open(sink, shared.config.stream_window);
        (inbound, Some(Box::pin(stream) as PayloadStream))
    } else {
        (Inbound::Idle, None)
    };
    let handler: BoxFuture<'static, Result<CallOutput, RpcError>> =
        match CallInput::new(shape, request, upstream_stream) {
            Some(input) => shared.run_incoming(info.clone(), input),
            None => {
                let err = RpcError::internal("call input does not match its shape");
                Box::pin(std::future::ready(Err::<CallOutput, RpcError>(err)))
            }
        };

    let task = CalleeTask {
        link: CallLink::new(shared.clone(), Side::Callee, call_ref),
        info,
        mailbox,
        handler: Some(handler),
        responded: false,
        upstream,
        downstream: Outbound::Idle,
        _route: route,
    };
    tokio::spawn(task.run().instrument(span));
}

impl CalleeTask {
    async fn run(mut self) {
        trace!("call opened");
        loop {
            if self.handler.is_none() && self.upstream.is_finished() && self.downstream.is_finished()
            {
                break;
            }
            tokio::select! {
                result = maybe(self.handler.as_mut()), if self.handler.is_some() => {
                    self.handler = None;
                    self.on_handler_result(result).await;
                }
                progress = self.upstream.progress() => self.on_upstream(progress).await,
                progress = self.downstream.progress() => {
                    self.downstream.settle(progress, &self.link).await;
                }
                frame = self.mailbox.recv(), if !self.upstream.is_blocked() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        debug!("connection lost");
                        self.terminate();
                    }
                },
            }
        }
        trace!("call finished");
    }

    async fn on_handler_result(&mut self, result: Result<CallOutput, RpcError>) {
        let result = match result {
            Ok(output) if !output.fits(self.info.shape) => Err(RpcError::internal(format!(
                "handler output does not fit a {} call",
                self.info.shape
            ))),
            other => other,
        };
        match result {
            Ok(CallOutput::Response(payload)) => {
                self.responded = self.link.send(DownstreamEvent::Response, payload).await;
                self.release_upstream().await;
            }
            Ok(CallOutput::Stream(stream)) => {
                let timeout = self.link.shared.config.stream_start_timeout;
                self.downstream = Outbound::offered(stream, timeout);
                let empty = SerializedPayload::empty(self.link.shared.format());
                self.link.send(DownstreamEvent::Opened, empty).await;
            }
            Err(err) => {
                debug!(error = %err, "call failed");
                self.link.error(&err).await;
                self.downstream.close();
                self.release_upstream().await;
            }
        }
    }

    async fn on_upstream(&mut self, progress: InboundProgress) {
        match progress {
            InboundProgress::StartRequested => {
                self.link.operation(StreamOperation::Start).await;
            }
            InboundProgress::Grant(n) => {
                self.link.operation(StreamOperation::Credit(n)).await;
            }
            InboundProgress::ConsumerGone => {
                trace!("handler dropped the upstream");
                self.upstream.abandon();
                self.link.operation(StreamOperation::Close).await;
            }
            InboundProgress::Delivered => {}
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let Event::Upstream(event) = frame.header.event else {
            warn!("downstream event routed to a callee");
            return;
        };
        let shape = self.info.shape;
        match event {
            UpstreamEvent::Open { .. } => {
                self.fail(RpcError::protocol_violation("call opened twice"))
                    .await;
            }
            UpstreamEvent::Data(StreamPart::Event(signal)) => {
                if !shape.has_upstream() {
                    let err = RpcError::protocol_violation(format!("{shape} call has no upstream"));
                    self.fail(err).await;
                    return;
                }
                let event = stream_event(&self.link.shared, signal, frame.payload);
                if let Err(err) = self.upstream.push(event) {
                    self.fail(err).await;
                }
            }
            UpstreamEvent::Data(StreamPart::Operation(StreamOperation::Start)) => {
                if !shape.has_downstream() {
                    let err =
                        RpcError::protocol_violation(format!("{shape} call has no downstream"));
                    self.fail(err).await;
                    return;
                }
                if let Err(err) = self.downstream.start(&self.link) {
                    self.fail(err).await;
                }
            }
            UpstreamEvent::Data(StreamPart::Operation(StreamOperation::Close)) => {
                trace!("caller stopped collecting");
                self.downstream.close();
            }
            UpstreamEvent::Data(StreamPart::Operation(StreamOperation::Credit(n))) => {
                if let Err(err) = self.downstream.grant(n) {
                    self.fail(err).await;
                }
            }
            UpstreamEvent::Error => {
                let err = self.link.shared.decode_error(&frame.payload);
                debug!(error = %err, "caller failed the call");
                self.terminate();
            }
            UpstreamEvent::Close => {
                debug!("caller cancelled the call");
                self.terminate();
            }
        }
    }

    /// Stop consuming the upstream once the handler no longer needs it.
    ///
    /// After a response the caller closes its upstream on its own.
    async fn release_upstream(&mut self) {
        if self.upstream.is_finished() {
            return;
        }
        self.upstream.abandon();
        if !self.responded {
            self.link.operation(StreamOperation::Close).await;
        }
    }

    async fn fail(&mut self, err: RpcError) {
        warn!(error = %err, "failing call");
        self.link.error(&err).await;
        self.terminate();
    }

    fn terminate(&mut self) {
        self.handler = None;
        self.downstream.close();
        self.upstream.abandon();
    }
}
