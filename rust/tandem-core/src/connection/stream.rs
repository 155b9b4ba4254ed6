use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;

use super::{ConnectionBackend, ConnectionError, closed_signal};

/// Longest LEB128 encoding of a `u64`.
const MAX_PREFIX_LEN: usize = 10;

/// Default maximum message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Prefix `message` with its LEB128 length, ready for a single write.
fn length_prefixed(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + MAX_PREFIX_LEN);
    let mut len = message.len() as u64;
    while len >= 0x80 {
        out.push((len as u8 & 0x7F) | 0x80);
        len >>= 7;
    }
    out.push(len as u8);
    out.extend_from_slice(message);
    out
}

/// Read one LEB128 length prefix.
///
/// `Ok(None)` means the peer closed the stream between two messages.
async fn read_length_prefix<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<u64>, ConnectionError> {
    let mut len = 0u64;
    for index in 0..MAX_PREFIX_LEN {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if index == 0 {
                    return Ok(None);
                }
                return Err(ConnectionError::Malformed(
                    "stream ended inside a length prefix".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        len |= u64::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some(len));
        }
    }
    Err(ConnectionError::Malformed(format!(
        "length prefix longer than {MAX_PREFIX_LEN} bytes"
    )))
}

/// Connection over any byte stream, with varint length-prefixed messages.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: Arc<AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>>,
    closed: watch::Sender<bool>,
    max_message_size: AtomicUsize,
}

impl StreamConnection {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Create a connection from separate reader and writer halves, such as
    /// the halves of a split TCP stream.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: Arc::new(AsyncMutex::new(Box::new(writer))),
                closed: watch::channel(false).0,
                max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub fn set_max_message_size(&self, size: usize) {
        self.inner.max_message_size.store(size, Ordering::Release);
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }

    async fn read_message(&self) -> Result<Vec<u8>, ConnectionError> {
        let mut reader = self.inner.reader.lock().await;

        let Some(len) = read_length_prefix(&mut **reader).await? else {
            return Err(ConnectionError::Closed);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);

        let max = self.inner.max_message_size.load(Ordering::Acquire);
        if len > max {
            return Err(ConnectionError::TooLarge { len, max });
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ConnectionError::Malformed(format!("stream ended inside a {len} byte message"))
            } else {
                ConnectionError::Io(e)
            }
        })?;
        Ok(buf)
    }
}

impl ConnectionBackend for StreamConnection {
    async fn send(&self, message: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_closed_inner() {
            return Err(ConnectionError::Closed);
        }

        let max = self.inner.max_message_size.load(Ordering::Acquire);
        if message.len() > max {
            return Err(ConnectionError::TooLarge {
                len: message.len(),
                max,
            });
        }

        let bytes = length_prefixed(&message);
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, ConnectionError> {
        if self.is_closed_inner() {
            return Err(ConnectionError::Closed);
        }

        tokio::select! {
            message = self.read_message() => message,
            _ = closed_signal(self.inner.closed.subscribe()) => Err(ConnectionError::Closed),
        }
    }

    fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        // Shut the write half down so the peer reads a clean EOF.
        let writer = self.inner.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut writer = writer.lock().await;
                let _ = writer.shutdown().await;
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}
