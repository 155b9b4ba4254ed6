//! Cold streams.
//!
//! A cold stream does not produce anything until its consumer starts
//! collecting it. On the receiving side of a call this is a [`ColdStream`]:
//! the first poll sends the start signal that the node turns into a `Start`
//! operation for the remote producer.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use tandem_wire::{RpcError, SerializationFormat, SerializedPayload, StreamEvent};

/// Untyped stream of serialized elements.
pub type PayloadStream = BoxStream<'static, Result<SerializedPayload, RpcError>>;

/// Typed stream of call elements.
pub type RpcStream<T> = BoxStream<'static, Result<T, RpcError>>;

/// Node-side half of a [`ColdStream`].
#[derive(Debug)]
pub(crate) struct ColdStreamSink {
    pub(crate) tx: mpsc::Sender<StreamEvent<SerializedPayload>>,
    pub(crate) start: oneshot::Receiver<()>,
}

pub(crate) fn cold_stream(buffer: usize) -> (ColdStreamSink, ColdStream) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let (start_tx, start_rx) = oneshot::channel();
    (
        ColdStreamSink {
            tx,
            start: start_rx,
        },
        ColdStream {
            rx,
            start: Some(start_tx),
            finished: false,
        },
    )
}

/// Consumer half of a cold stream delivered by the remote peer.
///
/// Ends after `Complete`, or after yielding exactly one error. Dropping it
/// tells the producer to stop.
#[derive(Debug)]
pub struct ColdStream {
    rx: mpsc::Receiver<StreamEvent<SerializedPayload>>,
    start: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl ColdStream {
    /// Whether collection has begun.
    pub fn is_started(&self) -> bool {
        self.start.is_none()
    }
}

impl Stream for ColdStream {
    type Item = Result<SerializedPayload, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(start) = this.start.take() {
            let _ = start.send(());
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Element(payload))) => Poll::Ready(Some(Ok(payload))),
            Poll::Ready(Some(StreamEvent::Complete)) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Error(err))) => {
                this.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(RpcError::connection_closed())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Deserialize every element of a payload stream.
pub fn decode_stream<T>(format: SerializationFormat, stream: PayloadStream) -> RpcStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    stream
        .map(move |item| item.and_then(|payload| Ok(format.deserialize(&payload)?)))
        .boxed()
}

/// Serialize every element of a typed stream.
pub fn encode_stream<T, S>(format: SerializationFormat, stream: S) -> PayloadStream
where
    T: Serialize + Send + 'static,
    S: Stream<Item = Result<T, RpcError>> + Send + 'static,
{
    stream
        .map(move |item| item.and_then(|value| Ok(format.serialize(&value)?)))
        .boxed()
}
