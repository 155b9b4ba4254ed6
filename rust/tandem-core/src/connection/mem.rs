use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{ConnectionBackend, ConnectionError, closed_signal};

const CHANNEL_CAPACITY: usize = 64;

/// In-process connection backed by a pair of bounded channels.
#[derive(Clone, Debug)]
pub struct MemConnection {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    /// Taken on close so the peer's receiver drains and then reports closed.
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    peer_closed: watch::Receiver<bool>,
}

impl MemConnection {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed_a, watch_a) = watch::channel(false);
        let (closed_b, watch_b) = watch::channel(false);

        let inner_a = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            closed: closed_a,
            peer_closed: watch_b,
        });

        let inner_b = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            closed: closed_b,
            peer_closed: watch_a,
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl ConnectionBackend for MemConnection {
    async fn send(&self, message: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed_inner() || *self.inner.peer_closed.borrow() {
            return Err(ConnectionError::Closed);
        }

        let tx = self.inner.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(ConnectionError::Closed);
        };

        // A closed peer never drains its receiver, so a full channel must not
        // block forever.
        tokio::select! {
            sent = tx.send(message) => sent.map_err(|_| ConnectionError::Closed),
            _ = closed_signal(self.inner.peer_closed.clone()) => Err(ConnectionError::Closed),
            _ = closed_signal(self.inner.closed.subscribe()) => Err(ConnectionError::Closed),
        }
    }

    async fn receive(&self) -> Result<Vec<u8>, ConnectionError> {
        if self.is_closed_inner() {
            return Err(ConnectionError::Closed);
        }

        let closed = self.inner.closed.subscribe();
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or(ConnectionError::Closed),
            _ = closed_signal(closed) => Err(ConnectionError::Closed),
        }
    }

    fn close(&self) {
        self.inner.closed.send_replace(true);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}
