use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tandem_core::{
    BoundExtension, CallDescriptor, CallInfo, CallInput, CallOutput, Connection, Extension,
    ExtensionContext, HandshakeConfig, Interceptor, Next, Node, NodeBuilder, Role, RpcError,
    ServiceDescription, SingleCall,
};
use tandem_session::{
    ContextUpdateRequest, ContextUpdateResult, Item, Key, SESSION_EXTENSION_ID, SESSION_SERVICE,
    SessionConfig, SessionError, SessionExtension, update_call,
};
use tokio::sync::{mpsc, watch};

const THEME: Key<String> = Key::new("theme");
const VOLUME: Key<u32> = Key::new("volume");

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ping() -> SingleCall<(), ()> {
    SingleCall::new("app", "ping")
}

fn app_service() -> ServiceDescription {
    ServiceDescription::new("app").with_call(CallDescriptor::single(&ping(), |()| async {
        Ok::<_, RpcError>(())
    }))
}

async fn connect(server: NodeBuilder, client: NodeBuilder) -> (Node, Node) {
    init_tracing();
    let (server_conn, client_conn) = Connection::mem_pair();
    let config = HandshakeConfig::default();
    let (server, client) = tokio::join!(
        server.connect(server_conn, Role::Server, &config),
        client.connect(client_conn, Role::Client, &config),
    );
    (server.unwrap(), client.unwrap())
}

/// Holds incoming context updates while `released` is false.
#[derive(Clone)]
struct HoldUpdates {
    released: watch::Receiver<bool>,
    arrived: mpsc::UnboundedSender<()>,
}

impl Interceptor for HoldUpdates {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        Box::pin(async move {
            if call.call == *update_call().id() && !*self.released.borrow() {
                let _ = self.arrived.send(());
                let mut released = self.released.clone();
                let _ = released.wait_for(|released| *released).await;
            }
            next.run(call, input).await
        })
    }
}

impl Extension for HoldUpdates {
    fn id(&self) -> &str {
        "hold-updates"
    }

    fn is_local(&self) -> bool {
        true
    }

    fn bind(&self, _context: ExtensionContext) -> BoundExtension {
        BoundExtension::new().with_incoming(self.clone())
    }
}

#[tokio::test]
async fn writes_replicate_in_both_directions() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (server, client) = connect(
        Node::builder().extension(server_ext.clone()),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let a = server_ext.session().unwrap();
    let b = client_ext.session().unwrap();
    assert_eq!(a.role(), Role::Server);
    assert_eq!(b.role(), Role::Client);

    b.set(&THEME, "dark".to_string()).await.unwrap();
    let expected = Item {
        revision: 0,
        value: "dark".to_string(),
    };
    assert_eq!(a.get(&THEME).unwrap(), Some(expected.clone()));
    assert_eq!(b.get(&THEME).unwrap(), Some(expected));

    a.set(&VOLUME, 7).await.unwrap();
    a.set(&VOLUME, 8).await.unwrap();
    assert_eq!(b.get(&VOLUME).unwrap(), Some(Item { revision: 1, value: 8 }));

    b.remove(&VOLUME).await.unwrap();
    assert_eq!(a.get(&VOLUME).unwrap(), None);
    assert_eq!(a.context().revision("volume"), Some(2));
    assert_eq!(b.context().revision("volume"), Some(2));

    client.close();
    server.close();
}

#[tokio::test]
async fn transactions_apply_all_writes_together() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (server, client) = connect(
        Node::builder().extension(server_ext.clone()),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let a = server_ext.session().unwrap();
    let b = client_ext.session().unwrap();

    let previous = b
        .transaction(|tx| {
            let previous = tx.get(&VOLUME)?;
            tx.set(&VOLUME, &previous.unwrap_or(0).saturating_add(5))?;
            tx.set(&THEME, &"light".to_string())?;
            Ok(previous)
        })
        .await
        .unwrap();
    assert_eq!(previous, None);
    assert_eq!(a.get(&VOLUME).unwrap().map(|item| item.value), Some(5));
    assert_eq!(a.get(&THEME).unwrap().map(|item| item.value), Some("light".to_string()));

    // Read-only transactions stay local.
    let volume = b.transaction(|tx| tx.get(&VOLUME)).await.unwrap();
    assert_eq!(volume, Some(5));
    assert_eq!(a.context().revision("volume"), Some(0));

    client.close();
    server.close();
}

#[tokio::test]
async fn stale_client_catches_up_and_recomputes() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (released_tx, released) = watch::channel(true);
    let (arrived, mut arrivals) = mpsc::unbounded_channel();
    let (server, client) = connect(
        Node::builder().extension(server_ext.clone()),
        Node::builder()
            .extension(client_ext.clone())
            .extension(HoldUpdates { released, arrived }),
    )
    .await;
    let a = server_ext.session().unwrap();
    let b = client_ext.session().unwrap();

    a.set(&THEME, "system".to_string()).await.unwrap();
    assert_eq!(b.context().revision("theme"), Some(0));

    // The server's next write is committed but its push to the client is held.
    released_tx.send_replace(false);
    let pushing = tokio::spawn({
        let a = a.clone();
        async move { a.set(&THEME, "dark".to_string()).await }
    });
    arrivals.recv().await.unwrap();
    assert_eq!(a.context().revision("theme"), Some(1));
    assert_eq!(b.context().revision("theme"), Some(0));

    let runs = AtomicUsize::new(0);
    let outcome = b
        .transaction(|tx| {
            runs.fetch_add(1, Ordering::SeqCst);
            if tx.get(&THEME)?.as_deref() == Some("system") {
                tx.set(&THEME, &"light".to_string())?;
                Ok("switched")
            } else {
                Ok("kept")
            }
        })
        .await
        .unwrap();
    assert_eq!(outcome, "kept");
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        b.get(&THEME).unwrap(),
        Some(Item {
            revision: 1,
            value: "dark".to_string()
        })
    );

    released_tx.send_replace(true);
    pushing.await.unwrap().unwrap();
    assert_eq!(a.get(&THEME).unwrap(), b.get(&THEME).unwrap());

    client.close();
    server.close();
}

/// Server-side stand-in for the session extension that refuses everything.
struct Stubborn {
    attempts: Arc<AtomicUsize>,
}

impl Extension for Stubborn {
    fn id(&self) -> &str {
        SESSION_EXTENSION_ID
    }

    fn bind(&self, _context: ExtensionContext) -> BoundExtension {
        let attempts = self.attempts.clone();
        let update = CallDescriptor::single(&update_call(), move |_: ContextUpdateRequest| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Ok::<_, RpcError>(ContextUpdateResult::Rejected {
                    reasons: Vec::new(),
                })
            }
        });
        let service = ServiceDescription::new(SESSION_SERVICE).with_call(update);
        BoundExtension::new().with_service(service)
    }
}

#[tokio::test]
async fn client_gives_up_after_max_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let client_ext = SessionExtension::with_config(SessionConfig { max_retries: 2 });
    let (server, client) = connect(
        Node::builder().extension(Stubborn {
            attempts: attempts.clone(),
        }),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let b = client_ext.session().unwrap();

    let err = b.set(&VOLUME, 1).await.unwrap_err();
    assert!(matches!(err, SessionError::TransactionFailed { attempts: 3 }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(b.get(&VOLUME).unwrap(), None);

    client.close();
    server.close();
}

#[tokio::test]
async fn clear_empties_both_replicas() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (server, client) = connect(
        Node::builder().extension(server_ext.clone()),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let a = server_ext.session().unwrap();
    let b = client_ext.session().unwrap();

    b.set(&THEME, "dark".to_string()).await.unwrap();
    b.clear().await.unwrap();
    assert!(a.context().is_empty());
    assert!(b.context().is_empty());

    // Revisions restart once a key is gone for good.
    a.set(&THEME, "light".to_string()).await.unwrap();
    assert_eq!(b.context().revision("theme"), Some(0));

    client.close();
    server.close();
}

#[tokio::test]
async fn application_calls_wait_for_local_transactions() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (released_tx, released) = watch::channel(false);
    let (arrived, mut arrivals) = mpsc::unbounded_channel();
    let (server, client) = connect(
        Node::builder()
            .service(app_service())
            .extension(server_ext.clone())
            .extension(HoldUpdates { released, arrived }),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let b = client_ext.session().unwrap();

    let writing = tokio::spawn({
        let b = b.clone();
        async move { b.set(&THEME, "dark".to_string()).await }
    });
    arrivals.recv().await.unwrap();

    let transport = client.transport();
    let mut pinging = tokio::spawn(async move { transport.single(&ping(), &()).await });
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut pinging)
            .await
            .is_err()
    );

    released_tx.send_replace(true);
    writing.await.unwrap().unwrap();
    pinging.await.unwrap().unwrap();

    client.close();
    server.close();
}

#[tokio::test]
async fn session_needs_both_peers() {
    let client_ext = SessionExtension::new();
    let (server, client) = connect(
        Node::builder(),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    assert!(!client.negotiated().has_extension(SESSION_EXTENSION_ID));
    assert!(client_ext.session().is_none());

    client.close();
    server.close();
}

#[tokio::test]
async fn shutdown_clears_the_context() {
    let server_ext = SessionExtension::new();
    let client_ext = SessionExtension::new();
    let (server, client) = connect(
        Node::builder().extension(server_ext.clone()),
        Node::builder().extension(client_ext.clone()),
    )
    .await;
    let a = server_ext.session().unwrap();
    a.set(&VOLUME, 3).await.unwrap();

    server.close();
    assert!(a.context().is_empty());
    assert!(server_ext.session().is_none());

    client.closed().await;
    assert!(client_ext.session().is_none());
}
