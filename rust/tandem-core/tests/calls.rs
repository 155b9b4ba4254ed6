//! Call shape conformance.
//!
//! Every scenario runs over both the in-memory and the byte-stream
//! connection, with a full handshake on both nodes.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{count, echo, echo_pair, init_tracing, ping, sum};
use futures_util::{StreamExt, future, stream};
use tandem_core::{
    CallDescriptor, Connection, Node, RpcError, RpcStream, ServiceDescription, StatusCode,
    UpstreamCall,
};
use tokio_stream::wrappers::ReceiverStream;

async fn run_single_round_trip(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let transport = client.transport();
    transport.single(&ping(), &()).await.unwrap();
    transport.single(&ping(), &()).await.unwrap();

    client.close();
    server.closed().await;
}

async fn run_downstream_in_order(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let numbers = client
        .transport()
        .cold_downstream(&count(), &3)
        .await
        .unwrap();
    let received: Vec<u32> = numbers.map(|n| n.unwrap()).collect().await;
    assert_eq!(received, vec![1, 2, 3]);

    client.close();
    server.close();
}

async fn run_empty_downstream(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let mut numbers = client
        .transport()
        .cold_downstream(&count(), &0)
        .await
        .unwrap();
    assert!(numbers.next().await.is_none());

    client.close();
    server.close();
}

async fn run_upstream_sum(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let upstream = stream::iter((1..=10u32).map(Ok::<_, RpcError>));
    let total = client
        .transport()
        .cold_upstream(&sum(), &(), upstream)
        .await
        .unwrap();
    assert_eq!(total, 55);

    client.close();
    server.close();
}

async fn run_upstream_error(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let upstream = stream::iter(vec![
        Ok(1u32),
        Err(RpcError::application("bad input")),
        Ok(2),
    ]);
    let err = client
        .transport()
        .cold_upstream(&sum(), &(), upstream)
        .await
        .unwrap_err();
    assert_eq!(err.code, StatusCode::Application);
    assert_eq!(err.message, "bad input");

    client.close();
    server.close();
}

async fn run_bistream_echo(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let words = stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
    let replies = client
        .transport()
        .cold_bistream(&echo(), &(), words)
        .await
        .unwrap();
    let replies: Vec<String> = replies.map(|w| w.unwrap()).collect().await;
    assert_eq!(replies, vec!["a".to_string(), "b".to_string()]);

    client.close();
    server.close();
}

/// Each upstream element is only produced after the previous reply arrived.
async fn run_bistream_lockstep(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let mut replies = client
        .transport()
        .cold_bistream(&echo(), &(), ReceiverStream::new(rx).map(Ok))
        .await
        .unwrap();

    for word in ["one", "two", "three"] {
        tx.send(word.to_string()).await.unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply, word);
    }
    drop(tx);
    assert!(replies.next().await.is_none());

    client.close();
    server.close();
}

async fn run_concurrent_calls(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;
    let transport = client.transport();

    let calls = (1..=16u32).map(|n| {
        let transport = transport.clone();
        async move {
            let numbers = transport.cold_downstream(&count(), &n).await.unwrap();
            let total: u32 = numbers.map(|n| n.unwrap()).collect::<Vec<_>>().await.iter().sum();
            (n, total)
        }
    });
    for (n, total) in future::join_all(calls).await {
        assert_eq!(total, n * (n + 1) / 2);
    }

    client.close();
    server.close();
}

/// Both peers serve and issue calls over the same connection.
async fn run_calls_in_both_directions(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = common::connect(
        make_pair,
        Node::builder().service(common::echo_service()),
        Node::builder().service(common::echo_service()),
    )
    .await;

    let (client_transport, server_transport) = (client.transport(), server.transport());
    let (ping, sum) = (ping(), sum());
    let (a, b) = tokio::join!(
        client_transport.single(&ping, &()),
        server_transport.cold_upstream(
            &sum,
            &(),
            stream::iter(vec![Ok::<_, RpcError>(4u32), Ok(5)])
        ),
    );
    a.unwrap();
    assert_eq!(b.unwrap(), 9);

    client.close();
    server.close();
}

/// Nothing is produced before the consumer polls a downstream.
async fn run_downstream_is_cold(make_pair: impl FnOnce() -> (Connection, Connection)) {
    init_tracing();
    let (server, client) = echo_pair(make_pair).await;

    let mut numbers = client
        .transport()
        .cold_downstream(&count(), &2)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(numbers.next().await.unwrap().unwrap(), 1);
    assert_eq!(numbers.next().await.unwrap().unwrap(), 2);
    assert!(numbers.next().await.is_none());

    client.close();
    server.close();
}

/// A consumer that stops reading holds its producer back.
async fn run_slow_consumer_throttles_producer(
    make_pair: impl FnOnce() -> (Connection, Connection),
) {
    init_tracing();
    let first = UpstreamCall::<(), u32, u32>::new("sip", "first");
    let service = ServiceDescription::new("sip").with_call(CallDescriptor::cold_upstream(
        &first,
        |(), mut numbers: RpcStream<u32>| async move {
            let head = numbers.next().await.transpose()?.unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RpcError>(head)
        },
    ));
    let (server, client) =
        common::connect(make_pair, Node::builder().service(service), Node::builder()).await;

    let pulled = Arc::new(AtomicUsize::new(0));
    let numbers = stream::iter(0..100_000u32)
        .inspect({
            let pulled = pulled.clone();
            move |_| {
                pulled.fetch_add(1, Ordering::Relaxed);
            }
        })
        .map(Ok::<_, RpcError>);
    let head = client
        .transport()
        .cold_upstream(&first, &(), numbers)
        .await
        .unwrap();
    assert_eq!(head, 0);

    let pulled = pulled.load(Ordering::Relaxed);
    assert!(pulled < 100, "producer ran {pulled} elements ahead of its consumer");

    client.close();
    server.close();
}

#[tokio::test]
async fn mem_single_round_trip() {
    run_single_round_trip(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_downstream_in_order() {
    run_downstream_in_order(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_empty_downstream() {
    run_empty_downstream(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_upstream_sum() {
    run_upstream_sum(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_upstream_error() {
    run_upstream_error(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_bistream_echo() {
    run_bistream_echo(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_bistream_lockstep() {
    run_bistream_lockstep(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_concurrent_calls() {
    run_concurrent_calls(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_calls_in_both_directions() {
    run_calls_in_both_directions(Connection::mem_pair).await;
}

#[tokio::test]
async fn mem_downstream_is_cold() {
    run_downstream_is_cold(Connection::mem_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_single_round_trip() {
    run_single_round_trip(Connection::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_downstream_in_order() {
    run_downstream_in_order(Connection::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_upstream_sum() {
    run_upstream_sum(Connection::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_bistream_echo() {
    run_bistream_echo(Connection::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_bistream_lockstep() {
    run_bistream_lockstep(Connection::stream_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_concurrent_calls() {
    run_concurrent_calls(Connection::stream_pair).await;
}

#[tokio::test]
async fn mem_slow_consumer_throttles_producer() {
    run_slow_consumer_throttles_producer(Connection::mem_pair).await;
}

#[cfg(feature = "stream")]
#[tokio::test]
async fn stream_slow_consumer_throttles_producer() {
    run_slow_consumer_throttles_producer(Connection::stream_pair).await;
}
