mod common;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{echo_service, init_tracing, ping};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tandem_core::{
    ClientState, Connection, HandshakeConfig, Node, ReconnectError, ReconnectingClient,
    RetryPolicy, Role,
};

fn quick_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

/// Connector that starts a fresh echo server node for every connection.
fn echo_connector(
    servers: Arc<Mutex<Vec<Node>>>,
    connects: Arc<AtomicU32>,
) -> impl Fn() -> BoxFuture<'static, Result<Connection, io::Error>> + Send + Sync + 'static {
    move || {
        let servers = servers.clone();
        connects.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let (server_conn, client_conn) = Connection::mem_pair();
            tokio::spawn(async move {
                let node = Node::builder()
                    .service(echo_service())
                    .connect(server_conn, Role::Server, &HandshakeConfig::default())
                    .await;
                if let Ok(node) = node {
                    servers.lock().push(node);
                }
            });
            Ok(client_conn)
        })
    }
}

/// The most recent server node, once its handshake finished.
async fn take_server(servers: &Mutex<Vec<Node>>) -> Node {
    loop {
        if let Some(node) = servers.lock().pop() {
            return node;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn connects_lazily_and_reconnects_after_loss() {
    init_tracing();
    let servers = Arc::new(Mutex::new(Vec::new()));
    let connects = Arc::new(AtomicU32::new(0));
    let client = ReconnectingClient::with_policy(
        echo_connector(servers.clone(), connects.clone()),
        Node::builder(),
        quick_policy(),
    );

    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    let transport = client.transport().await.unwrap();
    transport.single(&ping(), &()).await.unwrap();
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // Same node while it is alive.
    client.transport().await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    take_server(&servers).await.close();
    transport.closed().await;

    let transport = client.transport().await.unwrap();
    transport.single(&ping(), &()).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    client.close().await;
    assert!(matches!(
        client.transport().await,
        Err(ReconnectError::Closed)
    ));
}

#[tokio::test]
async fn gives_up_after_the_policy_is_exhausted() {
    init_tracing();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let connector = move || -> BoxFuture<'static, Result<Connection, io::Error>> {
        counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        })
    };
    let client = ReconnectingClient::with_policy(connector, Node::builder(), quick_policy());

    match client.transport().await {
        Err(ReconnectError::RetriesExhausted { attempts: made, .. }) => assert_eq!(made, 3),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(client.state(), ClientState::Failed);
}

#[tokio::test]
async fn reconnect_loop_follows_the_connection() {
    init_tracing();
    let servers = Arc::new(Mutex::new(Vec::new()));
    let connects = Arc::new(AtomicU32::new(0));
    let client = ReconnectingClient::with_policy(
        echo_connector(servers.clone(), connects.clone()),
        Node::builder(),
        quick_policy(),
    );
    let mut state = client.subscribe();
    let task = client.spawn_reconnect_loop();

    state
        .wait_for(|s| *s == ClientState::Connected)
        .await
        .unwrap();
    take_server(&servers).await.close();

    tokio::time::timeout(Duration::from_secs(5), async {
        while connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    client.transport().await.unwrap().single(&ping(), &()).await.unwrap();

    client.close().await;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
