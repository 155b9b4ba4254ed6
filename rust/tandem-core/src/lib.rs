//! Duplex RPC runtime.
//!
//! Two peers connect over a [`Connection`], agree on a serialization format,
//! protocol version and extensions during the [`handshake()`], and then both
//! issue and serve calls over the same connection. A call is one of four
//! shapes: single, cold upstream, cold downstream or cold bistream. Cold
//! streams only produce once their consumer starts collecting them.
//!
//! A [`Node`] routes frames to per-call tasks, runs incoming calls against
//! its [`ServiceRegistry`], and exposes a [`Transport`] for outgoing ones.
//! [`Extension`]s add interceptors and services to a node.

mod call;
mod client;
mod config;
mod connection;
mod deferred;
mod descriptor;
mod extension;
mod handshake;
mod interceptor;
mod logging;
mod node;
mod pending;
mod registry;
mod stream;
mod transport;

pub use call::*;
pub use client::*;
pub use config::*;
pub use connection::{Connection, ConnectionError};
#[cfg(feature = "mem")]
pub use connection::mem::MemConnection;
#[cfg(feature = "stream")]
pub use connection::stream::StreamConnection;
pub use deferred::*;
pub use descriptor::*;
pub use extension::*;
pub use handshake::*;
pub use interceptor::{Interceptor, Next};
pub use logging::*;
pub use node::{Node, NodeBuilder, NodeError};
pub use registry::*;
pub use stream::{ColdStream, PayloadStream, RpcStream, decode_stream, encode_stream};
pub use transport::*;

pub use tandem_wire::{
    CallRef, CallShape, RpcError, SerializationFormat, SerializedPayload, ServiceCallId,
    StatusCode, StreamEvent,
};
