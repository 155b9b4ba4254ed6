//! Typed entry points for issuing calls.

use std::sync::Arc;

use futures_core::Stream;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tandem_wire::{RpcError, SerializationFormat, ServiceCallId};

use crate::call::{CallInfo, CallInput, CallOutput};
use crate::descriptor::{BistreamCall, DownstreamCall, SingleCall, UpstreamCall};
use crate::handshake::Negotiated;
use crate::interceptor::{CallRunner, Interceptor, Next};
use crate::node::NodeShared;
use crate::pending::caller;
use crate::stream::{RpcStream, decode_stream, encode_stream};

/// Handle for issuing calls to the peer.
///
/// Cheap to clone. Every call goes through the node's outgoing interceptors,
/// except on the raw transport handed to extensions.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<NodeShared>,
    outgoing: Arc<[Arc<dyn Interceptor>]>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("negotiated", &self.shared.negotiated)
            .field("interceptors", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

struct Outgoing<'s> {
    shared: &'s Arc<NodeShared>,
}

impl CallRunner for Outgoing<'_> {
    fn run<'a>(
        &'a self,
        call: &'a CallInfo,
        input: CallInput,
    ) -> BoxFuture<'a, Result<CallOutput, RpcError>> {
        Box::pin(caller::start_call(self.shared.clone(), call.clone(), input))
    }
}

impl Transport {
    pub(crate) fn new(shared: Arc<NodeShared>, outgoing: Arc<[Arc<dyn Interceptor>]>) -> Self {
        Self { shared, outgoing }
    }

    pub fn format(&self) -> SerializationFormat {
        self.shared.format()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.shared.negotiated
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the node has shut down.
    pub async fn closed(&self) {
        self.shared.closed().await
    }

    /// Issue a call with serialized payloads.
    pub async fn call(
        &self,
        call: ServiceCallId,
        input: CallInput,
    ) -> Result<CallOutput, RpcError> {
        let info = CallInfo::outgoing(call, input.shape());
        let runner = Outgoing {
            shared: &self.shared,
        };
        Next::new(&self.outgoing, &runner).run(&info, input).await
    }

    pub async fn single<Req, Resp>(
        &self,
        call: &SingleCall<Req, Resp>,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let format = self.format();
        let input = CallInput::Single(format.serialize(request)?);
        let output = self.call(call.id().clone(), input).await?;
        Ok(format.deserialize(&output.into_response()?)?)
    }

    /// The upstream is not polled before the callee starts collecting it.
    pub async fn cold_upstream<Req, Up, Resp, S>(
        &self,
        call: &UpstreamCall<Req, Up, Resp>,
        request: &Req,
        upstream: S,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Up: Serialize + Send + 'static,
        Resp: DeserializeOwned,
        S: Stream<Item = Result<Up, RpcError>> + Send + 'static,
    {
        let format = self.format();
        let input = CallInput::ColdUpstream {
            request: format.serialize(request)?,
            upstream: encode_stream(format, upstream),
        };
        let output = self.call(call.id().clone(), input).await?;
        Ok(format.deserialize(&output.into_response()?)?)
    }

    /// Resolves once the callee offered its downstream; elements flow from
    /// the first poll of the returned stream on.
    pub async fn cold_downstream<Req, Down>(
        &self,
        call: &DownstreamCall<Req, Down>,
        request: &Req,
    ) -> Result<RpcStream<Down>, RpcError>
    where
        Req: Serialize,
        Down: DeserializeOwned + Send + 'static,
    {
        let format = self.format();
        let input = CallInput::ColdDownstream(format.serialize(request)?);
        let output = self.call(call.id().clone(), input).await?;
        Ok(decode_stream(format, output.into_stream()?))
    }

    pub async fn cold_bistream<Req, Up, Down, S>(
        &self,
        call: &BistreamCall<Req, Up, Down>,
        request: &Req,
        upstream: S,
    ) -> Result<RpcStream<Down>, RpcError>
    where
        Req: Serialize,
        Up: Serialize + Send + 'static,
        Down: DeserializeOwned + Send + 'static,
        S: Stream<Item = Result<Up, RpcError>> + Send + 'static,
    {
        let format = self.format();
        let input = CallInput::ColdBistream {
            request: format.serialize(request)?,
            upstream: encode_stream(format, upstream),
        };
        let output = self.call(call.id().clone(), input).await?;
        Ok(decode_stream(format, output.into_stream()?))
    }
}
