//! Caller side of a call: opens it, feeds the upstream, collects the result.

use std::sync::Arc;

use tandem_wire::{
    DownstreamEvent, Event, Frame, RpcError, SerializedPayload, StreamOperation, StreamPart,
    UpstreamEvent,
};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, debug_span, trace, warn};

use super::{CallLink, Inbound, InboundProgress, Outbound, RouteGuard, Side, stream_event};
use crate::call::{CallInfo, CallInput, CallOutput};
use crate::deferred::{Deferred, deferred};
use crate::node::NodeShared;
use crate::stream::{PayloadStream, cold_stream};

struct CallerTask {
    link: CallLink,
    info: CallInfo,
    mailbox: mpsc::UnboundedReceiver<Frame>,
    mailbox_open: bool,
    outcome: Deferred<Result<CallOutput, RpcError>>,
    upstream: Outbound,
    downstream: Inbound,
    route: RouteGuard,
}

/// Issue a call on the connection and wait for its outcome.
///
/// For streaming results the outcome arrives as soon as the callee opened
/// its downstream. Dropping the returned future cancels the call.
pub(crate) async fn start_call(
    shared: Arc<NodeShared>,
    info: CallInfo,
    input: CallInput,
) -> Result<CallOutput, RpcError> {
    let (call_ref, mailbox) = shared.register_caller()?;
    let span = debug_span!(
        parent: &shared.span,
        "call",
        call = %info.call,
        %call_ref,
        shape = %info.shape
    );
    let (request, upstream) = input.into_parts();
    let (outcome, result) = deferred();

    let task = CallerTask {
        link: CallLink::new(shared.clone(), Side::Caller, call_ref),
        info,
        mailbox,
        mailbox_open: true,
        outcome,
        upstream: Outbound::Idle,
        downstream: Inbound::Idle,
        route: RouteGuard::new(shared.clone(), Side::Caller, call_ref),
    };
    tokio::spawn(task.run(request, upstream).instrument(span));

    result
        .await
        .unwrap_or_else(|| Err(RpcError::internal("call ended without an outcome")))
}

impl CallerTask {
    async fn run(mut self, request: SerializedPayload, upstream: Option<PayloadStream>) {
        let open = UpstreamEvent::Open {
            call: self.info.call.clone(),
            shape: self.info.shape,
        };
        if !self.link.send(open, request).await {
            let _ = self.outcome.complete(Err(RpcError::connection_closed()));
            return;
        }
        if let Some(stream) = upstream {
            let timeout = self.link.shared.config.stream_start_timeout;
            self.upstream = Outbound::offered(stream, timeout);
        }
        trace!("call opened");

        loop {
            if self.outcome.is_completed()
                && self.upstream.is_finished()
                && self.downstream.is_finished()
            {
                break;
            }
            tokio::select! {
                _ = self.outcome.abandoned(), if !self.outcome.is_completed() => {
                    debug!("call cancelled locally");
                    self.link.close().await;
                    self.upstream.close();
                    self.downstream.abandon();
                    self.mailbox_open = false;
                    let _ = self.outcome.complete(Err(RpcError::cancelled()));
                }
                progress = self.upstream.progress() => {
                    self.upstream.settle(progress, &self.link).await;
                }
                progress = self.downstream.progress() => self.on_downstream(progress).await,
                frame = self.mailbox.recv(), if self.reading() => {
                    match frame {
                        Some(frame) => self.on_frame(frame).await,
                        None => {
                            debug!("connection lost");
                            self.finish(RpcError::connection_closed());
                        }
                    }
                }
            }
        }
        trace!("call finished");

        // Frames already queued for the call are judged like later ones.
        let CallerTask {
            link,
            mut mailbox,
            route,
            ..
        } = self;
        drop(route);
        mailbox.close();
        while let Ok(frame) = mailbox.try_recv() {
            link.shared.unroutable(frame);
        }
    }

    /// Whether the next frame may be taken from the mailbox.
    fn reading(&self) -> bool {
        self.mailbox_open && !self.downstream.is_blocked()
    }

    async fn on_downstream(&mut self, progress: InboundProgress) {
        match progress {
            InboundProgress::StartRequested => {
                self.link.operation(StreamOperation::Start).await;
            }
            InboundProgress::Grant(n) => {
                self.link.operation(StreamOperation::Credit(n)).await;
            }
            InboundProgress::ConsumerGone => {
                // The downstream is the application's last handle on the call.
                debug!("downstream dropped by the application");
                self.link.close().await;
                self.upstream.close();
                self.downstream.abandon();
                self.mailbox_open = false;
            }
            InboundProgress::Delivered => {}
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let Event::Downstream(event) = frame.header.event else {
            warn!("upstream event routed to a caller");
            return;
        };
        let shape = self.info.shape;
        match event {
            DownstreamEvent::Opened => {
                if !shape.has_downstream() {
                    let err = RpcError::protocol_violation(format!("{shape} call cannot be opened"));
                    self.fail(err).await;
                } else if self.outcome.is_completed() {
                    self.fail(RpcError::protocol_violation("call opened twice"))
                        .await;
                } else {
                    let config = &self.link.shared.config;
                    let (sink, stream) = cold_stream(config.stream_buffer);
                    self.downstream = Inbound::open(sink, config.stream_window);
                    let _ = self
                        .outcome
                        .complete(Ok(CallOutput::Stream(Box::pin(stream))));
                }
            }
            DownstreamEvent::Response => {
                if !shape.has_response() {
                    let err =
                        RpcError::protocol_violation(format!("{shape} call has no single response"));
                    self.fail(err).await;
                } else if self
                    .outcome
                    .complete(Ok(CallOutput::Response(frame.payload)))
                    .is_err()
                {
                    self.fail(RpcError::protocol_violation("second response for the call"))
                        .await;
                } else {
                    self.route.answered = true;
                    self.upstream.close();
                }
            }
            DownstreamEvent::Data(StreamPart::Event(signal)) => {
                if !shape.has_downstream() {
                    let err = RpcError::protocol_violation(format!("{shape} call has no downstream"));
                    self.fail(err).await;
                    return;
                }
                let event = stream_event(&self.link.shared, signal, frame.payload);
                match self.downstream.push(event) {
                    Ok(()) if signal.is_terminal() => self.route.answered = true,
                    Ok(()) => {}
                    Err(err) => self.fail(err).await,
                }
            }
            DownstreamEvent::Data(StreamPart::Operation(StreamOperation::Start)) => {
                if !shape.has_upstream() {
                    let err = RpcError::protocol_violation(format!("{shape} call has no upstream"));
                    self.fail(err).await;
                    return;
                }
                if let Err(err) = self.upstream.start(&self.link) {
                    self.fail(err).await;
                }
            }
            DownstreamEvent::Data(StreamPart::Operation(StreamOperation::Close)) => {
                trace!("callee stopped collecting");
                self.upstream.close();
            }
            DownstreamEvent::Data(StreamPart::Operation(StreamOperation::Credit(n))) => {
                if let Err(err) = self.upstream.grant(n) {
                    self.fail(err).await;
                }
            }
            DownstreamEvent::Error => {
                let err = self.link.shared.decode_error(&frame.payload);
                debug!(error = %err, "call failed remotely");
                self.finish(err);
            }
            DownstreamEvent::Close => {
                debug!("callee released the call");
                self.finish(RpcError::cancelled());
            }
            DownstreamEvent::Warning => {
                let warning = self
                    .link
                    .shared
                    .format()
                    .deserialize::<String>(&frame.payload)
                    .unwrap_or_else(|e| format!("undecodable warning: {e}"));
                warn!(%warning, "peer warning");
            }
        }
    }

    /// Report a violation to the callee and end the call with it.
    async fn fail(&mut self, err: RpcError) {
        warn!(error = %err, "failing call");
        self.link.error(&err).await;
        self.finish(err);
    }

    /// End the call with `err`, delivered wherever the caller still listens.
    fn finish(&mut self, err: RpcError) {
        self.mailbox_open = false;
        self.upstream.close();
        if !self.outcome.is_completed() {
            let _ = self.outcome.complete(Err(err));
        } else {
            self.downstream.fail(err);
        }
    }
}
