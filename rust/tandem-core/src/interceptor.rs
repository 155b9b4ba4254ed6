//! Interceptor chains.
//!
//! Every call passes through an ordered chain of interceptors before it
//! reaches the connection (outgoing) or the registered handler (incoming).
//! An interceptor receives the whole call and decides whether and how to
//! continue it through [`Next`]. It can:
//! - Inspect or rewrite the request payload
//! - Wrap the upstream or the resulting downstream
//! - Fail the call without continuing it
//! - Hold the call until some condition is met
//!
//! # Example
//!
//! ```ignore
//! struct Deny;
//!
//! impl Interceptor for Deny {
//!     fn intercept<'a>(
//!         &'a self,
//!         call: &'a CallInfo,
//!         input: CallInput,
//!         next: Next<'a>,
//!     ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
//!         Box::pin(async move {
//!             if call.call.service_id == "admin" {
//!                 return Err(RpcError::application("denied"));
//!             }
//!             next.run(call, input).await
//!         })
//!     }
//! }
//! ```

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tandem_wire::RpcError;

use crate::call::{CallInfo, CallInput, CallOutput};

pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>>;
}

/// What runs once a call made it through every interceptor.
pub(crate) trait CallRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>>;
}

/// Rest of the chain after the current interceptor.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    runner: &'a dyn CallRunner,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], runner: &'a dyn CallRunner) -> Self {
        Self { chain, runner }
    }

    /// Continue the call.
    pub fn run(
        self,
        call: &'a CallInfo,
        input: CallInput,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(
                call,
                input,
                Next {
                    chain: rest,
                    runner: self.runner,
                },
            ),
            None => self.runner.run(call, input),
        }
    }
}
