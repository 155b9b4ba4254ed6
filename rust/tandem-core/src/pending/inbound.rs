use std::collections::VecDeque;

use tandem_wire::{RpcError, SerializedPayload, StreamEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use super::maybe;
use crate::stream::ColdStreamSink;

/// A stream direction this side consumes.
pub(crate) enum Inbound {
    /// No stream (yet).
    Idle,
    /// Handed to the application.
    Open(InboundStream),
    /// The terminal event was delivered.
    Closed,
    /// The application dropped the stream; late events are discarded.
    Abandoned,
}

pub(crate) struct InboundStream {
    tx: mpsc::Sender<StreamEvent<SerializedPayload>>,
    /// Fires when the application first polls the stream.
    start: Option<oneshot::Receiver<()>>,
    started: bool,
    /// Events the application has not accepted yet.
    queue: VecDeque<StreamEvent<SerializedPayload>>,
    terminal_queued: bool,
    /// Elements the producer may still send.
    credit: u32,
    /// Elements handed over since the last grant.
    owed: u32,
    window: u32,
}

pub(crate) enum InboundProgress {
    /// The application began collecting; the producer may start.
    StartRequested,
    /// The producer may send this many more elements.
    Grant(u32),
    /// A queued event was handed over.
    Delivered,
    /// The application dropped the stream.
    ConsumerGone,
}

enum Flush {
    Pending,
    Done,
    Gone,
}

impl InboundStream {
    fn flush(&mut self) -> Flush {
        while let Some(event) = self.queue.pop_front() {
            let terminal = event.is_terminal();
            match self.tx.try_send(event) {
                Ok(()) if terminal => return Flush::Done,
                Ok(()) => self.owed += 1,
                Err(TrySendError::Full(event)) => {
                    self.queue.push_front(event);
                    return Flush::Pending;
                }
                Err(TrySendError::Closed(_)) => {
                    self.queue.clear();
                    return Flush::Gone;
                }
            }
        }
        Flush::Pending
    }

    /// Credit to hand back, once enough elements were taken to be worth a frame.
    fn take_grant(&mut self) -> Option<u32> {
        if !self.started || self.terminal_queued || self.owed < (self.window / 2).max(1) {
            return None;
        }
        let grant = std::mem::take(&mut self.owed);
        self.credit = self.credit.saturating_add(grant);
        Some(grant)
    }
}

impl Inbound {
    /// A stream granting its producer up to `window` elements in flight.
    pub(crate) fn open(sink: ColdStreamSink, window: u32) -> Self {
        Inbound::Open(InboundStream {
            tx: sink.tx,
            start: Some(sink.start),
            started: false,
            queue: VecDeque::new(),
            terminal_queued: false,
            credit: 0,
            owed: 0,
            window: window.max(1),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        !matches!(self, Inbound::Open(_))
    }

    /// Whether undelivered events are waiting for the application.
    ///
    /// No further frames should be read for the call while this holds.
    pub(crate) fn is_blocked(&self) -> bool {
        matches!(self, Inbound::Open(s) if !s.queue.is_empty())
    }

    /// Accept an event received from the producer.
    pub(crate) fn push(&mut self, event: StreamEvent<SerializedPayload>) -> Result<(), RpcError> {
        let stream = match &mut *self {
            Inbound::Open(stream) => stream,
            Inbound::Abandoned => {
                trace!("event for an abandoned stream discarded");
                return Ok(());
            }
            Inbound::Closed => {
                return Err(RpcError::protocol_violation(
                    "stream event after the stream ended",
                ));
            }
            Inbound::Idle => {
                return Err(RpcError::protocol_violation(
                    "stream event for a stream that is not open",
                ));
            }
        };
        if stream.terminal_queued {
            return Err(RpcError::protocol_violation(
                "stream event after the stream ended",
            ));
        }
        if !event.is_terminal() {
            if !stream.started {
                return Err(RpcError::protocol_violation(
                    "stream element before the stream was started",
                ));
            }
            if stream.credit == 0 {
                return Err(RpcError::protocol_violation(
                    "stream element beyond the granted credit",
                ));
            }
            stream.credit -= 1;
        }
        stream.terminal_queued = event.is_terminal();
        stream.queue.push_back(event);
        self.flush();
        Ok(())
    }

    /// End the stream with an error, after anything already queued.
    ///
    /// No-op unless the stream is open and not already ending.
    pub(crate) fn fail(&mut self, err: RpcError) {
        if let Inbound::Open(stream) = &mut *self {
            if stream.terminal_queued {
                return;
            }
            stream.terminal_queued = true;
            stream.queue.push_back(StreamEvent::Error(err));
            self.flush();
        }
    }

    /// Forget the stream; later events are discarded.
    pub(crate) fn abandon(&mut self) {
        if let Inbound::Open(_) = self {
            *self = Inbound::Abandoned;
        }
    }

    fn flush(&mut self) {
        if let Inbound::Open(stream) = &mut *self {
            match stream.flush() {
                Flush::Pending => {}
                Flush::Done => *self = Inbound::Closed,
                // Reported by the next `progress`, which sees the closed channel.
                Flush::Gone => {}
            }
        }
    }

    pub(crate) async fn progress(&mut self) -> InboundProgress {
        let Inbound::Open(stream) = &mut *self else {
            return std::future::pending().await;
        };
        if let Some(grant) = stream.take_grant() {
            return InboundProgress::Grant(grant);
        }
        let InboundStream {
            tx,
            start,
            started,
            queue,
            owed,
            window,
            ..
        } = stream;

        let delivered_terminal = tokio::select! {
            biased;
            signal = maybe(start.as_mut()), if start.is_some() => {
                *start = None;
                return match signal {
                    Ok(()) => {
                        *started = true;
                        *owed = *window;
                        InboundProgress::StartRequested
                    }
                    Err(_) => InboundProgress::ConsumerGone,
                };
            }
            permit = tx.reserve(), if !queue.is_empty() => match (permit, queue.pop_front()) {
                (Ok(permit), Some(event)) => {
                    let terminal = event.is_terminal();
                    permit.send(event);
                    if !terminal {
                        *owed += 1;
                    }
                    terminal
                }
                (Ok(_), None) => false,
                (Err(_), _) => return InboundProgress::ConsumerGone,
            },
            _ = tx.closed(), if queue.is_empty() => return InboundProgress::ConsumerGone,
        };

        if delivered_terminal {
            *self = Inbound::Closed;
        } else {
            self.flush();
        }
        InboundProgress::Delivered
    }
}
