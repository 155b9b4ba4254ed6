//! Duplex byte connections.
//!
//! The public API is the [`Connection`] enum. Each backend lives in its own
//! module under `connection/` and implements the internal
//! [`ConnectionBackend`] trait. A connection moves whole messages: framing of
//! the underlying byte stream is the backend's business.

use std::fmt;

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;

pub(crate) trait ConnectionBackend: Send + Sync + Clone + 'static {
    async fn send(&self, message: Vec<u8>) -> Result<(), ConnectionError>;
    async fn receive(&self) -> Result<Vec<u8>, ConnectionError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Connection {
    #[cfg(feature = "mem")]
    Mem(mem::MemConnection),
    #[cfg(feature = "stream")]
    Stream(stream::StreamConnection),
}

impl Connection {
    /// Send one message.
    pub async fn send(&self, message: Vec<u8>) -> Result<(), ConnectionError> {
        match self {
            #[cfg(feature = "mem")]
            Connection::Mem(c) => c.send(message).await,
            #[cfg(feature = "stream")]
            Connection::Stream(c) => c.send(message).await,
        }
    }

    /// Receive the next message.
    ///
    /// Returns [`ConnectionError::Closed`] once either side closed the
    /// connection.
    pub async fn receive(&self) -> Result<Vec<u8>, ConnectionError> {
        match self {
            #[cfg(feature = "mem")]
            Connection::Mem(c) => c.receive().await,
            #[cfg(feature = "stream")]
            Connection::Stream(c) => c.receive().await,
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Connection::Mem(c) => c.close(),
            #[cfg(feature = "stream")]
            Connection::Stream(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Connection::Mem(c) => c.is_closed(),
            #[cfg(feature = "stream")]
            Connection::Stream(c) => c.is_closed(),
        }
    }

    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemConnection::pair();
        (Connection::Mem(a), Connection::Mem(b))
    }

    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamConnection::pair();
        (Connection::Stream(a), Connection::Stream(b))
    }
}

#[cfg(feature = "mem")]
impl From<mem::MemConnection> for Connection {
    fn from(c: mem::MemConnection) -> Self {
        Connection::Mem(c)
    }
}

#[cfg(feature = "stream")]
impl From<stream::StreamConnection> for Connection {
    fn from(c: stream::StreamConnection) -> Self {
        Connection::Stream(c)
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    /// The connection was closed, locally or by the peer.
    Closed,
    Io(std::io::Error),
    /// The byte stream does not carry well-formed messages.
    Malformed(String),
    /// A message exceeded the configured size limit.
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::Io(e) => write!(f, "I/O error: {e}"),
            ConnectionError::Malformed(msg) => write!(f, "malformed message: {msg}"),
            ConnectionError::TooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds limit of {max}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

/// Resolves once the watched flag turns true or its sender is gone.
pub(crate) async fn closed_signal(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
