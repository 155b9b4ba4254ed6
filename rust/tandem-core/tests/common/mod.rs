#![allow(dead_code)]

use std::time::Duration;

use futures_util::{StreamExt, stream};
use tandem_core::{
    BistreamCall, CallDescriptor, Connection, DownstreamCall, HandshakeConfig, Node, NodeBuilder,
    Role, RpcError, RpcStream, ServiceDescription, SingleCall, UpstreamCall,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const ECHO: &str = "echo";

pub fn ping() -> SingleCall<(), ()> {
    SingleCall::new(ECHO, "ping")
}

pub fn count() -> DownstreamCall<u32, u32> {
    DownstreamCall::new(ECHO, "count")
}

pub fn sum() -> UpstreamCall<(), u32, u64> {
    UpstreamCall::new(ECHO, "sum")
}

pub fn echo() -> BistreamCall<(), String, String> {
    BistreamCall::new(ECHO, "echo")
}

pub fn fail() -> SingleCall<String, ()> {
    SingleCall::new(ECHO, "fail")
}

pub fn explode() -> SingleCall<String, ()> {
    SingleCall::new(ECHO, "explode")
}

pub fn nap() -> SingleCall<u64, ()> {
    SingleCall::new(ECHO, "nap")
}

/// Service exercising every call shape.
pub fn echo_service() -> ServiceDescription {
    ServiceDescription::new(ECHO)
        .with_call(CallDescriptor::single(&ping(), |()| async {
            Ok::<_, RpcError>(())
        }))
        .with_call(CallDescriptor::cold_downstream(&count(), |n: u32| async move {
            Ok::<_, RpcError>(stream::iter((1..=n).map(Ok::<u32, RpcError>)))
        }))
        .with_call(CallDescriptor::cold_upstream(
            &sum(),
            |(), mut numbers: RpcStream<u32>| async move {
                let mut total = 0u64;
                while let Some(n) = numbers.next().await {
                    total += u64::from(n?);
                }
                Ok::<_, RpcError>(total)
            },
        ))
        .with_call(CallDescriptor::cold_bistream(
            &echo(),
            |(), words: RpcStream<String>| async move { Ok::<_, RpcError>(words) },
        ))
        .with_call(CallDescriptor::single(&fail(), |message: String| async move {
            Err::<(), _>(RpcError::application(message))
        }))
        .with_call(CallDescriptor::single(&explode(), |reason: String| async move {
            if !reason.is_empty() {
                panic!("{reason}");
            }
            Ok::<_, RpcError>(())
        }))
        .with_call(CallDescriptor::single(&nap(), |millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, RpcError>(())
        }))
}

/// Connect a server and a client node over a fresh connection pair.
pub async fn connect(
    make_pair: impl FnOnce() -> (Connection, Connection),
    server: NodeBuilder,
    client: NodeBuilder,
) -> (Node, Node) {
    let (server_conn, client_conn) = make_pair();
    let config = HandshakeConfig::default();
    let (server, client) = tokio::join!(
        server.connect(server_conn, Role::Server, &config),
        client.connect(client_conn, Role::Client, &config),
    );
    (server.unwrap(), client.unwrap())
}

/// Server serving [`echo_service`], client serving nothing.
pub async fn echo_pair(make_pair: impl FnOnce() -> (Connection, Connection)) -> (Node, Node) {
    connect(
        make_pair,
        Node::builder().service(echo_service()),
        Node::builder(),
    )
    .await
}
