//! Call descriptors.
//!
//! Caller side: [`SingleCall`], [`UpstreamCall`], [`DownstreamCall`] and
//! [`BistreamCall`] pair a [`ServiceCallId`] with the request, element and
//! response types of one call. Callee side: a [`CallDescriptor`] pairs the
//! same identifier with a handler whose types are erased to payloads.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tandem_wire::{CallShape, RpcError, SerializationFormat, SerializedPayload, ServiceCallId};

use crate::call::{CallInput, CallOutput};
use crate::stream::{PayloadStream, RpcStream, decode_stream, encode_stream};

macro_rules! typed_call {
    ($(#[$meta:meta])* $name:ident<$($param:ident),+>, $shape:expr) => {
        $(#[$meta])*
        pub struct $name<$($param),+> {
            id: ServiceCallId,
            _types: PhantomData<fn() -> ($($param,)+)>,
        }

        impl<$($param),+> $name<$($param),+> {
            pub const SHAPE: CallShape = $shape;

            pub fn new(service_id: impl Into<String>, call_id: impl Into<String>) -> Self {
                Self {
                    id: ServiceCallId::new(service_id, call_id),
                    _types: PhantomData,
                }
            }

            pub fn id(&self) -> &ServiceCallId {
                &self.id
            }
        }

        impl<$($param),+> Clone for $name<$($param),+> {
            fn clone(&self) -> Self {
                Self {
                    id: self.id.clone(),
                    _types: PhantomData,
                }
            }
        }

        impl<$($param),+> fmt::Debug for $name<$($param),+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.id).finish()
            }
        }
    };
}

typed_call!(
    /// Single request, single response.
    SingleCall<Req, Resp>,
    CallShape::Single
);
typed_call!(
    /// Request plus a stream of `Up` elements, single response.
    UpstreamCall<Req, Up, Resp>,
    CallShape::ColdUpstream
);
typed_call!(
    /// Request, stream of `Down` elements in response.
    DownstreamCall<Req, Down>,
    CallShape::ColdDownstream
);
typed_call!(
    /// Request plus a stream of `Up` elements, stream of `Down` elements in
    /// response.
    BistreamCall<Req, Up, Down>,
    CallShape::ColdBistream
);

type ResponseHandler = dyn Fn(
        SerializationFormat,
        SerializedPayload,
        Option<PayloadStream>,
    ) -> BoxFuture<'static, Result<SerializedPayload, RpcError>>
    + Send
    + Sync;

type StreamHandler = dyn Fn(
        SerializationFormat,
        SerializedPayload,
        Option<PayloadStream>,
    ) -> BoxFuture<'static, Result<PayloadStream, RpcError>>
    + Send
    + Sync;

#[derive(Clone)]
enum Handler {
    Response(Arc<ResponseHandler>),
    Stream(Arc<StreamHandler>),
}

/// Callee-side registration of one call.
#[derive(Clone)]
pub struct CallDescriptor {
    id: ServiceCallId,
    shape: CallShape,
    handler: Handler,
}

impl fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl CallDescriptor {
    pub fn id(&self) -> &ServiceCallId {
        &self.id
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }

    /// Serve a [`SingleCall`].
    pub fn single<Req, Resp, F, Fut>(call: &SingleCall<Req, Resp>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |format: SerializationFormat,
                           request: SerializedPayload,
                           _upstream: Option<PayloadStream>|
              -> BoxFuture<'static, Result<SerializedPayload, RpcError>> {
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = format.deserialize(&request)?;
                let response = handler(request).await?;
                encode_response(format, &response)
            })
        };
        Self {
            id: call.id().clone(),
            shape: CallShape::Single,
            handler: Handler::Response(Arc::new(erased)),
        }
    }

    /// Serve an [`UpstreamCall`].
    pub fn cold_upstream<Req, Up, Resp, F, Fut>(
        call: &UpstreamCall<Req, Up, Resp>,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Up: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, RpcStream<Up>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |format: SerializationFormat,
                           request: SerializedPayload,
                           upstream: Option<PayloadStream>|
              -> BoxFuture<'static, Result<SerializedPayload, RpcError>> {
            let handler = handler.clone();
            Box::pin(async move {
                let upstream = upstream.ok_or_else(missing_upstream)?;
                let request: Req = format.deserialize(&request)?;
                let response = handler(request, decode_stream(format, upstream)).await?;
                encode_response(format, &response)
            })
        };
        Self {
            id: call.id().clone(),
            shape: CallShape::ColdUpstream,
            handler: Handler::Response(Arc::new(erased)),
        }
    }

    /// Serve a [`DownstreamCall`].
    ///
    /// The returned stream is not polled until the caller starts collecting.
    pub fn cold_downstream<Req, Down, F, Fut, S>(
        call: &DownstreamCall<Req, Down>,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Down: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: futures_core::Stream<Item = Result<Down, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |format: SerializationFormat,
                           request: SerializedPayload,
                           _upstream: Option<PayloadStream>|
              -> BoxFuture<'static, Result<PayloadStream, RpcError>> {
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = format.deserialize(&request)?;
                let downstream = handler(request).await?;
                Ok::<_, RpcError>(encode_stream(format, downstream))
            })
        };
        Self {
            id: call.id().clone(),
            shape: CallShape::ColdDownstream,
            handler: Handler::Stream(Arc::new(erased)),
        }
    }

    /// Serve a [`BistreamCall`].
    pub fn cold_bistream<Req, Up, Down, F, Fut, S>(
        call: &BistreamCall<Req, Up, Down>,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Up: DeserializeOwned + Send + 'static,
        Down: Serialize + Send + 'static,
        F: Fn(Req, RpcStream<Up>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: futures_core::Stream<Item = Result<Down, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased = move |format: SerializationFormat,
                           request: SerializedPayload,
                           upstream: Option<PayloadStream>|
              -> BoxFuture<'static, Result<PayloadStream, RpcError>> {
            let handler = handler.clone();
            Box::pin(async move {
                let upstream = upstream.ok_or_else(missing_upstream)?;
                let request: Req = format.deserialize(&request)?;
                let downstream = handler(request, decode_stream(format, upstream)).await?;
                Ok::<_, RpcError>(encode_stream(format, downstream))
            })
        };
        Self {
            id: call.id().clone(),
            shape: CallShape::ColdBistream,
            handler: Handler::Stream(Arc::new(erased)),
        }
    }

    /// Run the handler on an untyped input.
    pub fn invoke(
        &self,
        format: SerializationFormat,
        input: CallInput,
    ) -> BoxFuture<'static, Result<CallOutput, RpcError>> {
        if input.shape() != self.shape {
            let err = RpcError::protocol_violation(format!(
                "{} is a {} call, opened as {}",
                self.id,
                self.shape,
                input.shape()
            ));
            return Box::pin(async move { Err(err) });
        }
        let (request, upstream) = input.into_parts();
        match &self.handler {
            Handler::Response(handler) => {
                let fut = handler(format, request, upstream);
                Box::pin(async move { fut.await.map(CallOutput::Response) })
            }
            Handler::Stream(handler) => {
                let fut = handler(format, request, upstream);
                Box::pin(async move { fut.await.map(CallOutput::Stream) })
            }
        }
    }
}

fn encode_response<T: Serialize>(
    format: SerializationFormat,
    value: &T,
) -> Result<SerializedPayload, RpcError> {
    Ok(format.serialize(value)?)
}

fn missing_upstream() -> RpcError {
    RpcError::internal("streaming call dispatched without an upstream")
}
