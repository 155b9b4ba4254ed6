//! Single-assignment results.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Create a linked completion handle and result future.
pub fn deferred<T>() -> (Deferred<T>, DeferredResult<T>) {
    let (tx, rx) = oneshot::channel();
    (Deferred { tx: Some(tx) }, DeferredResult { rx })
}

/// Write side of a single-assignment result.
///
/// Completes at most once; every later attempt reports [`AlreadyCompleted`].
#[derive(Debug)]
pub struct Deferred<T> {
    tx: Option<oneshot::Sender<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyCompleted;

impl fmt::Display for AlreadyCompleted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "result was already completed")
    }
}

impl std::error::Error for AlreadyCompleted {}

impl<T> Deferred<T> {
    /// Store the result.
    ///
    /// Succeeds even when nobody waits for the result any more.
    pub fn complete(&mut self, value: T) -> Result<(), AlreadyCompleted> {
        let tx = self.tx.take().ok_or(AlreadyCompleted)?;
        let _ = tx.send(value);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }

    /// Resolves once the waiting side went away without a result.
    ///
    /// Never resolves after completion.
    pub async fn abandoned(&mut self) {
        match self.tx.as_mut() {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

/// Read side of a single-assignment result.
///
/// Resolves to `None` when the [`Deferred`] was dropped without a value.
#[derive(Debug)]
pub struct DeferredResult<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for DeferredResult<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}
