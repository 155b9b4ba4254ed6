//! Session context for tandem RPC.
//!
//! A [`SessionExtension`] gives both nodes of a connection a replica of one
//! key/value context. Every entry carries a revision. The server's replica is
//! authoritative: client transactions are checked against it and rejected
//! when they build on a stale revision, in which case the client catches up
//! and retries.

mod context;
mod error;
mod extension;
mod service;
mod transaction;
mod update;

pub use context::{Item, Key, SessionContext};
pub use error::SessionError;
pub use extension::*;
pub use service::{SESSION_SERVICE, clear_call, update_call};
pub use transaction::Transaction;
pub use update::*;
