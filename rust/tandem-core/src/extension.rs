//! Extensions.
//!
//! An extension adds interceptors and services to a node. Extensions are
//! negotiated during the handshake: one that only one side offers is
//! disabled. Local extensions skip negotiation and are always bound.

use std::sync::Arc;

use crate::handshake::Negotiated;
use crate::interceptor::Interceptor;
use crate::registry::ServiceDescription;
use crate::transport::Transport;

/// What an extension is given when a node binds it.
#[derive(Clone)]
pub struct ExtensionContext {
    /// Transport that bypasses every outgoing interceptor.
    pub transport: Transport,
    pub negotiated: Negotiated,
}

/// What an extension contributes to one node.
#[derive(Default)]
pub struct BoundExtension {
    pub incoming: Vec<Arc<dyn Interceptor>>,
    pub outgoing: Vec<Arc<dyn Interceptor>>,
    pub services: Vec<ServiceDescription>,
    /// Runs once when the node shuts down.
    pub teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl BoundExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_incoming(mut self, interceptor: impl Interceptor) -> Self {
        self.incoming.push(Arc::new(interceptor));
        self
    }

    pub fn with_outgoing(mut self, interceptor: impl Interceptor) -> Self {
        self.outgoing.push(Arc::new(interceptor));
        self
    }

    pub fn with_service(mut self, service: ServiceDescription) -> Self {
        self.services.push(service);
        self
    }

    pub fn on_teardown(mut self, teardown: impl FnOnce() + Send + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }
}

pub trait Extension: Send + Sync + 'static {
    /// Identifier exchanged during the handshake.
    fn id(&self) -> &str;

    /// Local extensions are bound without asking the peer.
    fn is_local(&self) -> bool {
        false
    }

    fn bind(&self, context: ExtensionContext) -> BoundExtension;
}
