//! Reconnecting client.
//!
//! [`ReconnectingClient`] owns a [`Connector`] and keeps one node alive on
//! top of the connections it produces. The first call to
//! [`ReconnectingClient::transport`] connects; once that node shuts down the
//! next call connects again, backing off between failed attempts according
//! to a [`RetryPolicy`]. Calls already in flight on a lost node fail with a
//! connection-closed error and are not replayed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HandshakeConfig, Role};
use crate::connection::{Connection, ConnectionError};
use crate::node::{Node, NodeBuilder, NodeError};
use crate::transport::Transport;

/// Produces new connections on demand.
///
/// Called on first use and after every disconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, std::io::Error>>;
}

impl<F> Connector for F
where
    F: Fn() -> BoxFuture<'static, Result<Connection, std::io::Error>> + Send + Sync + 'static,
{
    fn connect(&self) -> BoxFuture<'_, Result<Connection, std::io::Error>> {
        self()
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per reconnection before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-indexed).
    ///
    /// Never exceeds `max_backoff`, whatever the attempt count.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Observable connection state of a [`ReconnectingClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// The last reconnection ran out of attempts.
    Failed,
}

#[derive(Debug)]
pub enum ReconnectError {
    /// Every attempt failed; holds the last failure.
    RetriesExhausted { attempts: u32, last: NodeError },
    /// The client was closed.
    Closed,
}

impl fmt::Display for ReconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectError::RetriesExhausted { attempts, last } => {
                write!(f, "reconnection failed after {attempts} attempts: {last}")
            }
            ReconnectError::Closed => write!(f, "client is closed"),
        }
    }
}

impl std::error::Error for ReconnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconnectError::RetriesExhausted { last, .. } => Some(last),
            ReconnectError::Closed => None,
        }
    }
}

struct ClientInner {
    connector: Box<dyn Connector>,
    builder: NodeBuilder,
    handshake: HandshakeConfig,
    policy: RetryPolicy,
    node: Mutex<Option<Node>>,
    state: watch::Sender<ClientState>,
    closed: watch::Sender<bool>,
}

/// Client that re-establishes its node when the connection is lost.
///
/// Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("state", &*self.inner.state.borrow())
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl ReconnectingClient {
    /// Does not connect; the first [`transport`](Self::transport) call does.
    pub fn new(connector: impl Connector, builder: NodeBuilder) -> Self {
        Self::with_policy(connector, builder, RetryPolicy::default())
    }

    pub fn with_policy(
        connector: impl Connector,
        builder: NodeBuilder,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: Box::new(connector),
                builder,
                handshake: HandshakeConfig::default(),
                policy,
                node: Mutex::new(None),
                state: watch::channel(ClientState::Disconnected).0,
                closed: watch::channel(false).0,
            }),
        }
    }

    /// Replace the handshake configuration. Only valid before first use.
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.handshake = handshake;
        }
        self
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Transport of the live node, connecting first if there is none.
    pub async fn transport(&self) -> Result<Transport, ReconnectError> {
        if *self.inner.closed.borrow() {
            return Err(ReconnectError::Closed);
        }
        let mut node = self.inner.node.lock().await;
        if let Some(live) = node.as_ref() {
            if !live.is_closed() {
                return Ok(live.transport());
            }
            debug!("node is gone, reconnecting");
            *node = None;
            self.inner.state.send_replace(ClientState::Disconnected);
        }

        let fresh = self.connect_with_retries().await?;
        let transport = fresh.transport();
        *node = Some(fresh);
        Ok(transport)
    }

    async fn connect_with_retries(&self) -> Result<Node, ReconnectError> {
        let policy = &self.inner.policy;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.inner
                .state
                .send_replace(ClientState::Connecting { attempt });
            match self.connect_once().await {
                Ok(node) => {
                    info!(attempt, "connected");
                    self.inner.state.send_replace(ClientState::Connected);
                    return Ok(node);
                }
                Err(e) if attempt >= policy.max_attempts => {
                    warn!(attempt, error = %e, "giving up on reconnection");
                    self.inner.state.send_replace(ClientState::Failed);
                    return Err(ReconnectError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let backoff = policy.backoff_for_attempt(attempt);
                    debug!(attempt, error = %e, ?backoff, "connection attempt failed");
                    let mut closed = self.inner.closed.subscribe();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = closed.wait_for(|closed| *closed) => {
                            self.inner.state.send_replace(ClientState::Disconnected);
                            return Err(ReconnectError::Closed);
                        }
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Node, NodeError> {
        let connection = self
            .inner
            .connector
            .connect()
            .await
            .map_err(ConnectionError::from)?;
        self.inner
            .builder
            .clone()
            .connect(connection, Role::Client, &self.inner.handshake)
            .await
    }

    /// Reconnect in the background whenever the node shuts down, until the
    /// client is closed or a reconnection runs out of attempts.
    pub fn spawn_reconnect_loop(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut closed = client.inner.closed.subscribe();
            loop {
                let transport = match client.transport().await {
                    Ok(transport) => transport,
                    Err(e) => {
                        debug!(error = %e, "reconnect loop stopped");
                        return;
                    }
                };
                tokio::select! {
                    _ = transport.closed() => {
                        warn!("connection lost");
                    }
                    _ = closed.wait_for(|closed| *closed) => return,
                }
            }
        })
    }

    /// Close the current node and refuse further connections.
    pub async fn close(&self) {
        self.inner.closed.send_replace(true);
        if let Some(node) = self.inner.node.lock().await.take() {
            node.close();
        }
        self.inner.state.send_replace(ClientState::Disconnected);
    }
}
