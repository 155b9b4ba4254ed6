//! Extension negotiation, interceptor chains and extension services.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{echo_service, init_tracing, ping};
use futures_util::future::BoxFuture;
use tandem_core::{
    BoundExtension, CallDescriptor, CallDirection, CallInfo, CallInput, CallOutput, Connection,
    Extension, ExtensionContext, Interceptor, LoggingExtension, Next, Node, RpcError,
    ServiceDescription, SingleCall, StatusCode,
};

/// Extension that counts how often it was bound and what passed through it.
struct Recorder {
    id: &'static str,
    binds: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl Recorder {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            binds: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct Count(Arc<AtomicUsize>);

impl Interceptor for Count {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        next.run(call, input)
    }
}

fn whoami(id: &str) -> SingleCall<(), String> {
    SingleCall::new(id, "whoami")
}

impl Extension for Recorder {
    fn id(&self) -> &str {
        self.id
    }

    fn bind(&self, context: ExtensionContext) -> BoundExtension {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let role = context.negotiated.role.to_string();
        let service = ServiceDescription::new(self.id).with_call(CallDescriptor::single(
            &whoami(self.id),
            move |()| {
                let role = role.clone();
                async move { Ok::<_, RpcError>(role) }
            },
        ));
        BoundExtension::new()
            .with_incoming(Count(self.calls.clone()))
            .with_outgoing(Count(self.calls.clone()))
            .with_service(service)
    }
}

#[tokio::test]
async fn only_common_extensions_are_enabled() {
    init_tracing();
    let shared = Recorder::new("shared");
    let server_only = Recorder::new("server-only");
    let client_shared = Recorder::new("shared");
    let (shared_binds, server_only_binds, client_binds) = (
        shared.binds.clone(),
        server_only.binds.clone(),
        client_shared.binds.clone(),
    );

    let (server, client) = common::connect(
        Connection::mem_pair,
        Node::builder()
            .service(echo_service())
            .extension(shared)
            .extension(server_only),
        Node::builder().extension(client_shared),
    )
    .await;

    assert_eq!(server.negotiated().extensions, vec!["shared".to_string()]);
    assert_eq!(client.negotiated().extensions, vec!["shared".to_string()]);
    assert_eq!(shared_binds.load(Ordering::SeqCst), 1);
    assert_eq!(client_binds.load(Ordering::SeqCst), 1);
    assert_eq!(server_only_binds.load(Ordering::SeqCst), 0);

    // Services of an enabled extension are reachable, others are not.
    let transport = client.transport();
    let role = transport.single(&whoami("shared"), &()).await.unwrap();
    assert_eq!(role, "server");
    let err = transport
        .single(&whoami("server-only"), &())
        .await
        .unwrap_err();
    assert_eq!(err.code, StatusCode::NotFound);

    client.close();
    server.close();
}

#[tokio::test]
async fn interceptors_see_both_directions() {
    init_tracing();
    let server_recorder = Recorder::new("recorder");
    let client_recorder = Recorder::new("recorder");
    let (server_calls, client_calls) = (server_recorder.calls.clone(), client_recorder.calls.clone());

    let (server, client) = common::connect(
        Connection::mem_pair,
        Node::builder().service(echo_service()).extension(server_recorder),
        Node::builder().extension(client_recorder),
    )
    .await;

    client.transport().single(&ping(), &()).await.unwrap();
    client.transport().single(&ping(), &()).await.unwrap();
    assert_eq!(client_calls.load(Ordering::SeqCst), 2);
    assert_eq!(server_calls.load(Ordering::SeqCst), 2);

    client.close();
    server.close();
}

/// Fails incoming calls to one service before they reach their handler.
struct Gate {
    blocked: &'static str,
}

impl Interceptor for Gate {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        Box::pin(async move {
            if call.direction == CallDirection::Incoming && call.call.service_id == self.blocked {
                return Err(RpcError::application("gate closed"));
            }
            next.run(call, input).await
        })
    }
}

struct GateExtension;

impl Extension for GateExtension {
    fn id(&self) -> &str {
        "gate"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn bind(&self, _context: ExtensionContext) -> BoundExtension {
        BoundExtension::new().with_incoming(Gate { blocked: "echo" })
    }
}

#[tokio::test]
async fn local_extensions_skip_negotiation() {
    init_tracing();
    let (server, client) = common::connect(
        Connection::mem_pair,
        Node::builder().service(echo_service()).extension(GateExtension),
        Node::builder(),
    )
    .await;

    assert!(server.negotiated().extensions.is_empty());
    let err = client.transport().single(&ping(), &()).await.unwrap_err();
    assert_eq!(err, RpcError::application("gate closed"));

    client.close();
    server.close();
}

#[tokio::test]
async fn teardown_runs_once_on_close() {
    struct Teardown(Arc<AtomicUsize>);

    impl Extension for Teardown {
        fn id(&self) -> &str {
            "teardown"
        }

        fn is_local(&self) -> bool {
            true
        }

        fn bind(&self, _context: ExtensionContext) -> BoundExtension {
            let runs = self.0.clone();
            BoundExtension::new().on_teardown(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    init_tracing();
    let runs = Arc::new(AtomicUsize::new(0));
    let (server, client) = common::connect(
        Connection::mem_pair,
        Node::builder().service(echo_service()),
        Node::builder().extension(Teardown(runs.clone())),
    )
    .await;

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    server.close();
    client.closed().await;
    client.close();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn logging_extension_is_transparent() {
    init_tracing();
    let (server, client) = common::connect(
        Connection::mem_pair,
        Node::builder()
            .service(echo_service())
            .extension(LoggingExtension::new()),
        Node::builder().extension(LoggingExtension::new().with_level(tracing::Level::INFO)),
    )
    .await;

    let transport = client.transport();
    transport.single(&ping(), &()).await.unwrap();
    let err = transport
        .single(&common::fail(), &"logged".to_string())
        .await
        .unwrap_err();
    assert_eq!(err.message, "logged");
    assert!(server.negotiated().extensions.is_empty());

    client.close();
    server.close();
}
