use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tandem_wire::{RpcError, SerializedPayload, StreamSignal};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{Instrument, debug, trace};

use super::CallLink;
use crate::stream::PayloadStream;

/// A stream direction this side produces.
pub(crate) enum Outbound {
    /// Nothing offered (yet).
    Idle,
    /// Offered to the peer; waiting for its `Start` until the deadline.
    Offered {
        stream: PayloadStream,
        deadline: Pin<Box<Sleep>>,
        credits: Arc<Semaphore>,
    },
    /// Elements are being forwarded to the peer, one per credit.
    Started {
        task: JoinHandle<()>,
        credits: Arc<Semaphore>,
    },
    Closed,
}

pub(crate) enum OutboundProgress {
    /// The peer never started the stream.
    TimedOut,
    /// Forwarding ended; the terminal event was sent.
    Finished,
}

impl Outbound {
    pub(crate) fn offered(stream: PayloadStream, timeout: Duration) -> Self {
        Outbound::Offered {
            stream,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            credits: Arc::new(Semaphore::new(0)),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self, Outbound::Idle | Outbound::Closed)
    }

    /// Begin forwarding after the peer's `Start`.
    pub(crate) fn start(&mut self, link: &CallLink) -> Result<(), RpcError> {
        match std::mem::replace(self, Outbound::Closed) {
            Outbound::Offered {
                stream, credits, ..
            } => {
                let task = forward(link.clone(), stream, credits.clone()).in_current_span();
                *self = Outbound::Started {
                    task: tokio::spawn(task),
                    credits,
                };
                Ok(())
            }
            Outbound::Closed => {
                trace!("start for a closed stream ignored");
                Ok(())
            }
            Outbound::Idle => {
                *self = Outbound::Idle;
                Err(RpcError::protocol_violation(
                    "start for a stream that was never offered",
                ))
            }
            started @ Outbound::Started { .. } => {
                *self = started;
                Err(RpcError::protocol_violation("stream started twice"))
            }
        }
    }

    /// Let the producer send `n` more elements.
    pub(crate) fn grant(&mut self, n: u32) -> Result<(), RpcError> {
        let credits = match self {
            Outbound::Offered { credits, .. } | Outbound::Started { credits, .. } => credits,
            Outbound::Closed => {
                trace!("credit for a closed stream ignored");
                return Ok(());
            }
            Outbound::Idle => {
                return Err(RpcError::protocol_violation(
                    "credit for a stream that was never offered",
                ));
            }
        };
        let room = Semaphore::MAX_PERMITS - credits.available_permits();
        if n as usize > room {
            return Err(RpcError::protocol_violation("stream credit overflow"));
        }
        credits.add_permits(n as usize);
        Ok(())
    }

    /// Stop producing. Idempotent.
    pub(crate) fn close(&mut self) {
        match std::mem::replace(self, Outbound::Closed) {
            Outbound::Started { task, .. } => task.abort(),
            Outbound::Offered { .. } => trace!("offered stream dropped before start"),
            Outbound::Idle | Outbound::Closed => {}
        }
    }

    pub(crate) async fn progress(&mut self) -> OutboundProgress {
        match self {
            Outbound::Offered { deadline, .. } => {
                deadline.as_mut().await;
                OutboundProgress::TimedOut
            }
            Outbound::Started { task, .. } => {
                let _ = task.await;
                OutboundProgress::Finished
            }
            Outbound::Idle | Outbound::Closed => std::future::pending().await,
        }
    }

    /// Handle a progress report, sending whatever the peer must learn.
    pub(crate) async fn settle(&mut self, progress: OutboundProgress, link: &CallLink) {
        match progress {
            OutboundProgress::TimedOut => {
                debug!("stream was not started in time");
                self.close();
                let empty = SerializedPayload::empty(link.shared.format());
                link.signal(StreamSignal::Timeout, empty).await;
            }
            OutboundProgress::Finished => *self = Outbound::Closed,
        }
    }
}

/// Forward every element of `stream`, then its terminal event.
///
/// Each element waits for one credit; terminal events need none.
async fn forward(link: CallLink, mut stream: PayloadStream, credits: Arc<Semaphore>) {
    let mut forwarded = 0u64;
    loop {
        let next = match AssertUnwindSafe(stream.next()).catch_unwind().await {
            Ok(next) => next,
            Err(_) => {
                let err = RpcError::internal("stream producer panicked");
                tracing::error!(forwarded, "stream producer panicked");
                link.signal(StreamSignal::Error, link.shared.error_payload(&err))
                    .await;
                return;
            }
        };
        match next {
            Some(Ok(payload)) => {
                match credits.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }
                if !link.signal(StreamSignal::Element, payload).await {
                    return;
                }
                forwarded += 1;
            }
            Some(Err(err)) => {
                debug!(forwarded, error = %err, "stream failed");
                link.signal(StreamSignal::Error, link.shared.error_payload(&err))
                    .await;
                return;
            }
            None => {
                trace!(forwarded, "stream complete");
                let empty = SerializedPayload::empty(link.shared.format());
                link.signal(StreamSignal::Complete, empty).await;
                return;
            }
        }
    }
}
