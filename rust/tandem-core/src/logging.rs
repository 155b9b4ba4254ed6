//! Call logging as an extension.
//!
//! [`LoggingExtension`] wraps every incoming and outgoing call and records
//! when it starts, how it ends, how long it took and how many elements each
//! of its streams carried. It is local: the peer does not need it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use tandem_wire::RpcError;
use tracing::{Level, debug, event, warn};

use crate::call::{CallInfo, CallInput, CallOutput};
use crate::extension::{BoundExtension, Extension, ExtensionContext};
use crate::interceptor::{Interceptor, Next};
use crate::stream::PayloadStream;

pub const LOGGING_EXTENSION_ID: &str = "tandem.logging";

/// Logs every call passing through the node.
#[derive(Debug, Clone, Copy)]
pub struct LoggingExtension {
    level: Level,
}

impl Default for LoggingExtension {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
        }
    }
}

impl LoggingExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level used for call starts and successful outcomes. Failures are
    /// always logged as warnings.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }
}

impl Extension for LoggingExtension {
    fn id(&self) -> &str {
        LOGGING_EXTENSION_ID
    }

    fn is_local(&self) -> bool {
        true
    }

    fn bind(&self, _context: ExtensionContext) -> BoundExtension {
        BoundExtension::new()
            .with_incoming(CallLogger { level: self.level })
            .with_outgoing(CallLogger { level: self.level })
    }
}

struct CallLogger {
    level: Level,
}

// `tracing` needs the level as a constant at each call site.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => event!(Level::ERROR, $($arg)+),
            Level::WARN => event!(Level::WARN, $($arg)+),
            Level::INFO => event!(Level::INFO, $($arg)+),
            Level::DEBUG => event!(Level::DEBUG, $($arg)+),
            _ => event!(Level::TRACE, $($arg)+),
        }
    };
}

impl Interceptor for CallLogger {
    fn intercept<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        Box::pin(async move {
            let started = Instant::now();
            log_at!(
                self.level,
                call = %call.call,
                shape = %call.shape,
                direction = %call.direction,
                request_len = input.request().len(),
                "call started"
            );
            let input = input.map_upstream(|upstream| counted(upstream, call, "upstream"));

            let result = next.run(call, input).await;
            let elapsed = started.elapsed();
            match result {
                Ok(CallOutput::Response(payload)) => {
                    log_at!(
                        self.level,
                        call = %call.call,
                        direction = %call.direction,
                        ?elapsed,
                        response_len = payload.len(),
                        "call succeeded"
                    );
                    Ok(CallOutput::Response(payload))
                }
                Ok(CallOutput::Stream(stream)) => {
                    log_at!(
                        self.level,
                        call = %call.call,
                        direction = %call.direction,
                        ?elapsed,
                        "call opened its downstream"
                    );
                    Ok(CallOutput::Stream(counted(stream, call, "downstream")))
                }
                Err(err) => {
                    warn!(
                        call = %call.call,
                        direction = %call.direction,
                        ?elapsed,
                        code = ?err.code,
                        error = %err,
                        "call failed"
                    );
                    Err(err)
                }
            }
        })
    }
}

/// Logs the element count of a stream once it is dropped.
struct StreamTally {
    call: String,
    leg: &'static str,
    elements: AtomicU64,
    failed: AtomicU64,
}

impl Drop for StreamTally {
    fn drop(&mut self) {
        debug!(
            call = %self.call,
            leg = self.leg,
            elements = self.elements.load(Ordering::Relaxed),
            errors = self.failed.load(Ordering::Relaxed),
            "stream finished"
        );
    }
}

fn counted(stream: PayloadStream, call: &CallInfo, leg: &'static str) -> PayloadStream {
    let tally = Arc::new(StreamTally {
        call: call.call.to_string(),
        leg,
        elements: AtomicU64::new(0),
        failed: AtomicU64::new(0),
    });
    stream
        .inspect(move |item| match item {
            Ok(_) => {
                tally.elements.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .boxed()
}
