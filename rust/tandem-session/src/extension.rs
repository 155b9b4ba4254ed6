//! Session extension and handle.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tandem_core::{
    BoundExtension, CallInfo, CallInput, CallOutput, Extension, ExtensionContext, Interceptor,
    Next, Role, RpcError, Transport,
};
use tracing::{debug, warn};

use crate::context::{Item, Key, SessionContext};
use crate::error::SessionError;
use crate::service::{SESSION_SERVICE, clear_call, session_service, update_call};
use crate::transaction::Transaction;
use crate::update::ContextUpdateResult;

pub const SESSION_EXTENSION_ID: &str = "tandem.session";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Times a rejected transaction is recomputed and resent.
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { max_retries: 10 }
    }
}

/// Adds a replicated [`SessionContext`] to every node it is bound to.
///
/// Clones share the session of the most recently bound node.
#[derive(Clone, Default)]
pub struct SessionExtension {
    config: SessionConfig,
    current: Arc<Mutex<Option<SessionHandle>>>,
}

impl fmt::Debug for SessionExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionExtension")
            .field("config", &self.config)
            .field("bound", &self.current.lock().is_some())
            .finish()
    }
}

impl SessionExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            config,
            current: Arc::default(),
        }
    }

    /// Session of the node this extension is bound to, until that node shuts
    /// down.
    pub fn session(&self) -> Option<SessionHandle> {
        self.current.lock().clone()
    }
}

impl Extension for SessionExtension {
    fn id(&self) -> &str {
        SESSION_EXTENSION_ID
    }

    fn bind(&self, context: ExtensionContext) -> BoundExtension {
        let role = context.negotiated.role;
        let replica = Arc::new(SessionContext::new(context.negotiated.format));
        let in_flight = Arc::new(tokio::sync::Mutex::new(()));
        let inner = Arc::new(SessionInner {
            role,
            context: replica.clone(),
            transport: context.transport,
            in_flight: in_flight.clone(),
            config: self.config.clone(),
        });
        debug!(%role, "session bound");

        let bound = Arc::downgrade(&inner);
        *self.current.lock() = Some(SessionHandle { inner });
        let current = self.current.clone();
        let teardown_replica = replica.clone();

        BoundExtension::new()
            .with_incoming(SessionGate {
                in_flight: in_flight.clone(),
            })
            .with_outgoing(SessionGate { in_flight })
            .with_service(session_service(replica, role))
            .on_teardown(move || {
                teardown_replica.clear();
                let mut current = current.lock();
                if current
                    .as_ref()
                    .is_some_and(|handle| std::ptr::eq(Arc::as_ptr(&handle.inner), bound.as_ptr()))
                {
                    *current = None;
                }
                debug!("session torn down");
            })
    }
}

/// Holds calls back while a local transaction is in flight.
///
/// Calls of the session service itself always pass.
struct SessionGate {
    in_flight: Arc<tokio::sync::Mutex<()>>,
}

impl Interceptor for SessionGate {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        if call.call.service_id == SESSION_SERVICE {
            return next.run(call, input);
        }
        Box::pin(async move {
            drop(self.in_flight.lock().await);
            next.run(call, input).await
        })
    }
}

struct SessionInner {
    role: Role,
    context: Arc<SessionContext>,
    /// Bypasses the node's outgoing interceptors.
    transport: Transport,
    in_flight: Arc<tokio::sync::Mutex<()>>,
    config: SessionConfig,
}

/// Access to one node's session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("role", &self.inner.role)
            .field("context", &self.inner.context)
            .finish()
    }
}

impl SessionHandle {
    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    pub fn get<V: DeserializeOwned>(&self, key: &Key<V>) -> Result<Option<Item<V>>, SessionError> {
        self.inner.context.get(key)
    }

    /// Run `f` as one transaction and replicate its writes.
    ///
    /// Transactions of one side run one at a time. On the client a rejected
    /// batch is reconciled with the server's state and `f` runs again, up to
    /// [`SessionConfig::max_retries`] times. On the server the batch is
    /// committed locally first, then pushed to the client; a push error means
    /// the client may not have seen the change.
    pub async fn transaction<T, F>(&self, mut f: F) -> Result<T, SessionError>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, SessionError>,
    {
        let inner = &self.inner;
        let _in_flight = inner.in_flight.lock().await;
        let attempts = inner.config.max_retries.saturating_add(1);

        for attempt in 1..=attempts {
            let (value, request) = {
                let mut tx = Transaction::new(&inner.context);
                let value = f(&mut tx)?;
                (value, tx.into_request())
            };
            if !request.has_mutations() {
                return Ok(value);
            }

            let result = match inner.role {
                Role::Server => {
                    let result = inner.context.try_commit(&request);
                    if result.is_accepted() {
                        let pushed = inner.transport.single(&update_call(), &request).await?;
                        if !pushed.is_accepted() {
                            warn!("client refused a committed update");
                        }
                    }
                    result
                }
                Role::Client => {
                    let result = inner.transport.single(&update_call(), &request).await?;
                    if result.is_accepted() {
                        inner.context.apply(&request);
                    }
                    result
                }
            };

            match result {
                ContextUpdateResult::Accepted => {
                    debug!(attempt, updates = request.updates.len(), "transaction accepted");
                    return Ok(value);
                }
                ContextUpdateResult::Rejected { reasons } => {
                    debug!(attempt, conflicts = reasons.len(), "transaction rejected");
                    inner.context.reconcile(reasons);
                }
            }
        }

        warn!(attempts, "transaction kept being rejected");
        Err(SessionError::TransactionFailed { attempts })
    }

    pub async fn set<V: Serialize>(&self, key: &Key<V>, value: V) -> Result<(), SessionError> {
        self.transaction(|tx| tx.set(key, &value)).await
    }

    pub async fn remove<V>(&self, key: &Key<V>) -> Result<(), SessionError> {
        self.transaction(|tx| {
            tx.remove(key);
            Ok(())
        })
        .await
    }

    /// Clear the context on both sides.
    pub async fn clear(&self) -> Result<(), SessionError> {
        let _in_flight = self.inner.in_flight.lock().await;
        self.inner.context.clear();
        self.inner.transport.single(&clear_call(), &()).await?;
        Ok(())
    }
}
