//! Wire types for tandem RPC.
//!
//! Everything in this crate is what two peers agree on: how a call is
//! addressed, how frames are tagged, and how errors travel. Payloads stay
//! opaque ([`SerializedPayload`]) until a state machine decodes them against
//! the type it expects.

mod error;
mod event;
mod frame;
mod handshake;
mod ids;

pub use error::*;
pub use event::*;
pub use frame::*;
pub use handshake::*;
pub use ids::*;

pub use tandem_codec::{CodecError, PayloadKind, SerializationFormat, SerializedPayload};
