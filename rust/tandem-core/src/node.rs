//! Protocol node.
//!
//! A node owns one connection after a successful handshake. Its receive loop
//! decodes frames and routes them to the task driving the call they belong
//! to. Calls issued by this node and calls served by it live in separate
//! routing tables: the direction of a frame's event tells which table its
//! reference belongs to.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tandem_wire::{
    CallRef, DownstreamEvent, Event, Frame, RpcError, SerializationFormat, SerializedPayload,
    StreamPart, UpstreamEvent,
};
use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::call::{CallInfo, CallInput, CallOutput};
use crate::config::{HandshakeConfig, NodeConfig, Role};
use crate::connection::{Connection, ConnectionError, closed_signal};
use crate::extension::{Extension, ExtensionContext};
use crate::handshake::{HandshakeError, Negotiated, handshake};
use crate::interceptor::{CallRunner, Interceptor, Next};
use crate::pending::{Side, callee};
use crate::registry::{RegistryError, ServiceDescription, ServiceRegistry};
use crate::transport::Transport;

#[derive(Debug)]
pub enum NodeError {
    Connection(ConnectionError),
    Handshake(HandshakeError),
    Registry(RegistryError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Connection(e) => write!(f, "connection error: {e}"),
            NodeError::Handshake(e) => write!(f, "handshake failed: {e}"),
            NodeError::Registry(e) => write!(f, "service registration failed: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NodeError::Connection(e) => Some(e),
            NodeError::Handshake(e) => Some(e),
            NodeError::Registry(e) => Some(e),
        }
    }
}

impl From<ConnectionError> for NodeError {
    fn from(e: ConnectionError) -> Self {
        NodeError::Connection(e)
    }
}

impl From<HandshakeError> for NodeError {
    fn from(e: HandshakeError) -> Self {
        NodeError::Handshake(e)
    }
}

impl From<RegistryError> for NodeError {
    fn from(e: RegistryError) -> Self {
        NodeError::Registry(e)
    }
}

/// Outgoing calls remembered after they finish.
const FINISHED_MEMORY: usize = 64;

#[derive(Default)]
struct RoutingTable {
    next_ref: u32,
    /// Calls this node issued, by our reference.
    callers: HashMap<CallRef, mpsc::UnboundedSender<Frame>>,
    /// Calls this node serves, by the peer's reference.
    callees: HashMap<CallRef, mpsc::UnboundedSender<Frame>>,
    /// Recently finished outgoing calls, and whether the callee answered them.
    finished: VecDeque<(CallRef, bool)>,
    closed: bool,
}

impl RoutingTable {
    fn table(&mut self, side: Side) -> &mut HashMap<CallRef, mpsc::UnboundedSender<Frame>> {
        match side {
            Side::Caller => &mut self.callers,
            Side::Callee => &mut self.callees,
        }
    }

    fn remember(&mut self, call_ref: CallRef, answered: bool) {
        if self.finished.len() == FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back((call_ref, answered));
    }

    /// Whether a finished outgoing call was answered; `None` if unknown.
    fn answered(&self, call_ref: CallRef) -> Option<bool> {
        self.finished
            .iter()
            .rev()
            .find(|(finished, _)| *finished == call_ref)
            .map(|(_, answered)| *answered)
    }
}

/// Incoming dispatch, fixed once extensions are bound.
struct Dispatch {
    registry: ServiceRegistry,
    incoming: Vec<Arc<dyn Interceptor>>,
    teardown: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

pub(crate) struct NodeShared {
    pub(crate) connection: Connection,
    pub(crate) negotiated: Negotiated,
    pub(crate) config: NodeConfig,
    pub(crate) span: tracing::Span,
    routes: Mutex<RoutingTable>,
    dispatch: OnceLock<Dispatch>,
    closed: watch::Sender<bool>,
}

impl NodeShared {
    pub(crate) fn format(&self) -> SerializationFormat {
        self.negotiated.format
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) async fn closed(&self) {
        closed_signal(self.closed.subscribe()).await
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        trace!(call_ref = %frame.call_ref(), event = ?frame.event(), "sending frame");
        let bytes = frame
            .encode(self.format())
            .map_err(|e| ConnectionError::Malformed(e.to_string()))?;
        self.connection.send(bytes).await
    }

    fn payload<T: Serialize + ?Sized>(&self, value: &T) -> SerializedPayload {
        self.format().serialize(value).unwrap_or_else(|e| {
            error!(error = %e, "could not serialize control payload");
            SerializedPayload::empty(self.format())
        })
    }

    pub(crate) fn error_payload(&self, err: &RpcError) -> SerializedPayload {
        self.payload(err)
    }

    pub(crate) fn decode_error(&self, payload: &SerializedPayload) -> RpcError {
        self.format()
            .deserialize::<RpcError>(payload)
            .unwrap_or_else(|e| RpcError::serialization(format!("undecodable error payload: {e}")))
    }

    /// Allocate a reference for a new outgoing call and register its mailbox.
    pub(crate) fn register_caller(
        &self,
    ) -> Result<(CallRef, mpsc::UnboundedReceiver<Frame>), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock();
        if routes.closed {
            return Err(RpcError::connection_closed());
        }
        // Skip references still held by long-running calls after wrap-around.
        loop {
            let call_ref = CallRef(routes.next_ref);
            routes.next_ref = routes.next_ref.wrapping_add(1);
            if !routes.callers.contains_key(&call_ref) {
                routes.finished.retain(|(finished, _)| *finished != call_ref);
                routes.callers.insert(call_ref, tx);
                return Ok((call_ref, rx));
            }
        }
    }

    /// Forget a call's mailbox. Outgoing calls are remembered for a while,
    /// so that late frames for them can be told apart from stray ones.
    pub(crate) fn unroute(&self, side: Side, call_ref: CallRef, answered: bool) {
        let mut routes = self.routes.lock();
        routes.table(side).remove(&call_ref);
        if side == Side::Caller {
            routes.remember(call_ref, answered);
        }
    }

    fn route(self: &Arc<Self>, frame: Frame) {
        let call_ref = frame.call_ref();
        let side = match frame.event() {
            Event::Upstream(UpstreamEvent::Open { .. }) => {
                self.accept(frame);
                return;
            }
            Event::Upstream(_) => Side::Callee,
            Event::Downstream(_) => Side::Caller,
        };

        let mailbox = self.routes.lock().table(side).get(&call_ref).cloned();
        let frame = match mailbox {
            Some(mailbox) => match mailbox.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        self.unroutable(frame);
    }

    fn accept(self: &Arc<Self>, frame: Frame) {
        let call_ref = frame.call_ref();
        let Event::Upstream(UpstreamEvent::Open { call, shape }) = frame.header.event else {
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let duplicate = {
            let mut routes = self.routes.lock();
            if routes.closed {
                return;
            }
            if routes.callees.contains_key(&call_ref) {
                true
            } else {
                routes.callees.insert(call_ref, tx);
                false
            }
        };
        if duplicate {
            warn!(%call_ref, call = %call, "open for a reference already in use");
            self.warn_peer(call_ref, format!("reference {call_ref} is already in use"));
            return;
        }

        debug!(%call_ref, call = %call, %shape, "incoming call");
        callee::spawn(self, call_ref, call, shape, frame.payload, rx);
    }

    /// Handle a frame whose call has no live mailbox.
    pub(crate) fn unroutable(self: &Arc<Self>, frame: Frame) {
        let call_ref = frame.call_ref();
        match frame.header.event {
            Event::Upstream(UpstreamEvent::Close | UpstreamEvent::Error) => {
                debug!(%call_ref, "release of an unknown call ignored");
            }
            Event::Upstream(event) => {
                warn!(%call_ref, ?event, "frame for an unknown incoming call");
                self.warn_peer(call_ref, format!("no call with reference {call_ref}"));
            }
            Event::Downstream(DownstreamEvent::Close | DownstreamEvent::Warning) => {
                debug!(%call_ref, "late frame for a finished call ignored");
            }
            Event::Downstream(event) => {
                let answered = self.routes.lock().answered(call_ref);
                match (answered, event) {
                    (Some(true), DownstreamEvent::Response) => {
                        self.answered_twice(call_ref, "second response for the call");
                    }
                    (Some(true), DownstreamEvent::Opened) => {
                        self.answered_twice(call_ref, "call opened after it was answered");
                    }
                    (Some(true), DownstreamEvent::Data(StreamPart::Event(_))) => {
                        self.answered_twice(call_ref, "stream event after the call was answered");
                    }
                    (Some(_), event) | (None, event @ DownstreamEvent::Data(_)) => {
                        debug!(%call_ref, ?event, "late frame for a finished call ignored");
                    }
                    (None, event) => {
                        warn!(%call_ref, ?event, "frame for an unknown outgoing call");
                    }
                }
            }
        }
    }

    /// The callee went on after answering: fail the call on its side.
    fn answered_twice(self: &Arc<Self>, call_ref: CallRef, message: &str) {
        let err = RpcError::protocol_violation(message);
        warn!(%call_ref, error = %err, "peer answered a finished call");
        self.notify_peer(Frame::new(call_ref, UpstreamEvent::Error, self.error_payload(&err)));
    }

    fn warn_peer(self: &Arc<Self>, call_ref: CallRef, message: String) {
        let frame = Frame::new(call_ref, DownstreamEvent::Warning, self.payload(&message));
        self.notify_peer(frame);
    }

    fn notify_peer(self: &Arc<Self>, frame: Frame) {
        let shared = self.clone();
        tokio::spawn(
            async move {
                let _ = shared.send_frame(frame).await;
            }
            .instrument(self.span.clone()),
        );
    }

    /// Run an incoming call through the incoming interceptors and its handler.
    pub(crate) fn run_incoming(
        self: &Arc<Self>,
        info: CallInfo,
        input: CallInput,
    ) -> BoxFuture<'static, Result<CallOutput, RpcError>> {
        let shared = self.clone();
        let call = async move {
            let Some(dispatch) = shared.dispatch.get() else {
                return Err(RpcError::internal("node is not ready"));
            };
            let runner = Dispatcher {
                registry: &dispatch.registry,
                format: shared.format(),
            };
            Next::new(&dispatch.incoming, &runner).run(&info, input).await
        };
        Box::pin(async move {
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(%message, "handler panicked");
                    Err(RpcError::internal("handler panicked").with_details(message))
                }
            }
        })
    }

    /// Tear down every call and close the connection. Idempotent.
    pub(crate) fn shutdown(&self) {
        let (callers, callees) = {
            let mut routes = self.routes.lock();
            if routes.closed {
                return;
            }
            routes.closed = true;
            (
                std::mem::take(&mut routes.callers),
                std::mem::take(&mut routes.callees),
            )
        };
        debug!(
            callers = callers.len(),
            callees = callees.len(),
            "node shutting down"
        );
        drop((callers, callees));
        self.connection.close();
        if let Some(dispatch) = self.dispatch.get() {
            let hooks = std::mem::take(&mut *dispatch.teardown.lock());
            for hook in hooks {
                hook();
            }
        }
        self.closed.send_replace(true);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Dispatcher<'r> {
    registry: &'r ServiceRegistry,
    format: SerializationFormat,
}

impl CallRunner for Dispatcher<'_> {
    fn run<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        match self.registry.get_call_by_id(&call.call) {
            Some(descriptor) => descriptor.invoke(self.format, input),
            None => {
                debug!(call = %call.call, "no such call");
                let err = RpcError::not_found(&call.call);
                Box::pin(std::future::ready(Err::<CallOutput, RpcError>(err)))
            }
        }
    }
}

async fn receive_loop(shared: Arc<NodeShared>) {
    loop {
        let bytes = match shared.connection.receive().await {
            Ok(bytes) => bytes,
            Err(ConnectionError::Closed) => {
                debug!("connection closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "connection failed");
                break;
            }
        };
        let frame = match Frame::decode(shared.format(), &bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "dropping undecodable frame");
                continue;
            }
        };
        trace!(call_ref = %frame.call_ref(), event = ?frame.event(), "received frame");
        shared.route(frame);
    }
    shared.shutdown();
}

/// Builds a [`Node`] from services and extensions.
#[derive(Clone, Default)]
pub struct NodeBuilder {
    config: NodeConfig,
    services: Vec<ServiceDescription>,
    extensions: Vec<Arc<dyn Extension>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service(mut self, service: ServiceDescription) -> Self {
        self.services.push(service);
        self
    }

    pub fn extension(self, extension: impl Extension) -> Self {
        self.shared_extension(Arc::new(extension))
    }

    pub fn shared_extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Ids of the extensions to offer during the handshake.
    pub fn advertised_extensions(&self) -> Vec<String> {
        self.extensions
            .iter()
            .filter(|ext| !ext.is_local())
            .map(|ext| ext.id().to_string())
            .collect()
    }

    /// Run the handshake on `connection`, then build the node.
    ///
    /// The connection is closed when anything fails.
    pub async fn connect(
        self,
        connection: Connection,
        role: Role,
        config: &HandshakeConfig,
    ) -> Result<Node, NodeError> {
        let mut config = config.clone();
        for id in self.advertised_extensions() {
            if !config.extensions.contains(&id) {
                config.extensions.push(id);
            }
        }
        let negotiated = match handshake(&connection, role, &config).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                connection.close();
                return Err(e.into());
            }
        };
        self.build(connection, negotiated)
    }

    /// Start a node on a connection that already completed its handshake.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self, connection: Connection, negotiated: Negotiated) -> Result<Node, NodeError> {
        let span = info_span!("node", role = %negotiated.role);
        let shared = Arc::new(NodeShared {
            connection,
            negotiated,
            config: self.config,
            span,
            routes: Mutex::new(RoutingTable::default()),
            dispatch: OnceLock::new(),
            closed: watch::channel(false).0,
        });

        let raw = Transport::new(shared.clone(), Arc::from(Vec::new()));
        let mut registry = ServiceRegistry::new();
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        let mut teardown = Vec::new();

        let bound = {
            let _enter = shared.span.enter();
            let mut bound = Vec::new();
            for ext in &self.extensions {
                if !ext.is_local() && !shared.negotiated.has_extension(ext.id()) {
                    debug!(extension = ext.id(), "extension not negotiated, skipping");
                    continue;
                }
                debug!(extension = ext.id(), "binding extension");
                bound.push(ext.bind(ExtensionContext {
                    transport: raw.clone(),
                    negotiated: shared.negotiated.clone(),
                }));
            }
            bound
        };

        let registered = (|| {
            for service in self.services {
                registry.register(service)?;
            }
            for ext in bound {
                incoming.extend(ext.incoming);
                outgoing.extend(ext.outgoing);
                teardown.extend(ext.teardown);
                for service in ext.services {
                    registry.register(service)?;
                }
            }
            Ok::<(), RegistryError>(())
        })();
        if let Err(e) = registered {
            shared.connection.close();
            return Err(e.into());
        }

        let _ = shared.dispatch.set(Dispatch {
            registry,
            incoming,
            teardown: Mutex::new(teardown),
        });

        let span = shared.span.clone();
        tokio::spawn(receive_loop(shared.clone()).instrument(span));

        Ok(Node {
            transport: Transport::new(shared.clone(), Arc::from(outgoing)),
            shared,
        })
    }
}

/// A running protocol node.
///
/// Dropping the node does not close the connection; call [`Node::close`].
pub struct Node {
    shared: Arc<NodeShared>,
    transport: Transport,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("negotiated", &self.shared.negotiated)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    /// Transport for issuing calls through the outgoing interceptors.
    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.shared.negotiated
    }

    /// Close the connection and fail every call in flight. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the node has shut down, for whatever reason.
    pub async fn closed(&self) {
        self.shared.closed().await
    }
}
