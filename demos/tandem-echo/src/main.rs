//! tandem-echo: a server exposing one call of every shape, and a client that
//! exercises them over TCP.
//!
//! # Usage
//!
//! ```bash
//! tandem-echo server --listen 127.0.0.1:9400
//! tandem-echo client --connect 127.0.0.1:9400 --count 5
//! ```

use std::error::Error;

use clap::{Parser, Subcommand};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt, stream};
use tandem_core::{
    BistreamCall, CallDescriptor, Connection, DownstreamCall, HandshakeConfig, LoggingExtension,
    Node, NodeBuilder, ReconnectingClient, Role, RpcError, RpcStream, ServiceDescription,
    SingleCall, StreamConnection, UpstreamCall,
};
use tandem_session::{Key, SessionExtension};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const ECHO: &str = "echo";
const GREETING: Key<String> = Key::new("greeting");

fn ping() -> SingleCall<String, String> {
    SingleCall::new(ECHO, "ping")
}

fn count() -> DownstreamCall<u32, u32> {
    DownstreamCall::new(ECHO, "count")
}

fn sum() -> UpstreamCall<(), u32, u64> {
    UpstreamCall::new(ECHO, "sum")
}

fn shout() -> BistreamCall<(), String, String> {
    BistreamCall::new(ECHO, "shout")
}

fn echo_service() -> ServiceDescription {
    ServiceDescription::new(ECHO)
        .with_call(CallDescriptor::single(&ping(), |text: String| async move {
            Ok::<_, RpcError>(text)
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
            &shout(),
            |(), words: RpcStream<String>| async move {
                Ok::<_, RpcError>(words.map_ok(|word| word.to_uppercase()))
            },
        ))
}

#[derive(Parser, Debug)]
#[command(name = "tandem-echo")]
#[command(about = "Echo server and client speaking tandem RPC over TCP")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo service.
    Server {
        #[arg(long, default_value = "127.0.0.1:9400")]
        listen: String,
    },
    /// Call every echo method once.
    Client {
        #[arg(long, default_value = "127.0.0.1:9400")]
        connect: String,
        /// How many numbers to stream each way.
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Server { listen } => serve(&listen).await,
        Command::Client { connect, count } => run_client(connect, count).await,
    };
    if let Err(e) = result {
        error!(%e, "tandem-echo failed");
        std::process::exit(1);
    }
}

fn builder(session: &SessionExtension) -> NodeBuilder {
    Node::builder()
        .extension(LoggingExtension::default())
        .extension(session.clone())
}

async fn serve(listen: &str) -> Result<(), Box<dyn Error>> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let session = SessionExtension::new();
            let connection = Connection::Stream(StreamConnection::new(socket));
            let node = builder(&session)
                .service(echo_service())
                .connect(connection, Role::Server, &HandshakeConfig::default())
                .await;
            match node {
                Ok(node) => {
                    info!(%peer, "peer connected");
                    node.closed().await;
                    info!(%peer, "peer gone");
                }
                Err(e) => warn!(%peer, %e, "handshake failed"),
            }
        });
    }
}

async fn run_client(addr: String, n: u32) -> Result<(), Box<dyn Error>> {
    let session = SessionExtension::new();
    let connector = move || -> BoxFuture<'static, std::io::Result<Connection>> {
        let addr = addr.clone();
        async move {
            let socket = TcpStream::connect(addr).await?;
            Ok(Connection::Stream(StreamConnection::new(socket)))
        }
        .boxed()
    };
    let client = ReconnectingClient::new(connector, builder(&session));
    let transport = client.transport().await?;

    let pong = transport.single(&ping(), &"hello".to_string()).await?;
    info!(%pong, "ping");

    let counted: Vec<u32> = transport
        .cold_downstream(&count(), &n)
        .await?
        .try_collect()
        .await?;
    info!(?counted, "count");

    let numbers = stream::iter((1..=n).map(Ok::<u32, RpcError>));
    let total = transport.cold_upstream(&sum(), &(), numbers).await?;
    info!(total, "sum");

    let words = stream::iter(["tandem", "rpc"].map(|word| Ok::<_, RpcError>(word.to_string())));
    let shouted: Vec<String> = transport
        .cold_bistream(&shout(), &(), words)
        .await?
        .try_collect()
        .await?;
    info!(?shouted, "shout");

    if let Some(handle) = session.session() {
        handle.set(&GREETING, pong).await?;
        info!(greeting = ?handle.get(&GREETING)?, "session");
    }

    client.close().await;
    Ok(())
}
