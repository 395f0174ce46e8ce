//! Service descriptors.
//!
//! A [`ServiceDesc`] bundles a service name with its unary method and stream
//! handlers. Registering one with the runtime makes every handler reachable
//! on both call channels. [`ServiceInfo`] is the handler-free view read by
//! introspection.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use serde::Serialize;

use crate::rpc::{CallContext, Status};

pub type UnaryFuture = BoxFuture<'static, Result<Bytes, Status>>;
pub type UnaryHandler = Arc<dyn Fn(CallContext, Bytes) -> UnaryFuture + Send + Sync>;

/// Sequence of encoded messages flowing in one direction of a stream.
pub type MessageStream = BoxStream<'static, Result<Bytes, Status>>;
pub type StreamFuture = BoxFuture<'static, Result<MessageStream, Status>>;
pub type StreamHandler = Arc<dyn Fn(CallContext, MessageStream) -> StreamFuture + Send + Sync>;

#[derive(Clone)]
pub struct MethodDesc {
    pub name: String,
    pub handler: UnaryHandler,
}

#[derive(Clone)]
pub struct StreamDesc {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
    pub handler: StreamHandler,
}

/// A service ready for registration.
#[derive(Clone)]
pub struct ServiceDesc {
    name: String,
    methods: BTreeMap<String, MethodDesc>,
    streams: BTreeMap<String, StreamDesc>,
    metadata: BTreeMap<String, String>,
}

impl ServiceDesc {
    /// `name` is the fully qualified service name, e.g. `echo.Echo`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
            streams: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a unary method over raw encoded messages.
    pub fn unary<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        let name = name.into();
        let handler: UnaryHandler = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        self.methods.insert(name.clone(), MethodDesc { name, handler });
        self
    }

    /// Add a unary method over protobuf messages.
    pub fn unary_message<Req, Resp, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        Req: prost::Message + Default + 'static,
        Resp: prost::Message + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.unary(name, move |ctx, bytes: Bytes| {
            call_message(Arc::clone(&handler), ctx, bytes)
        })
    }

    /// Add a streaming method.
    pub fn stream<F, Fut>(
        mut self,
        name: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(CallContext, MessageStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MessageStream, Status>> + Send + 'static,
    {
        let name = name.into();
        let handler: StreamHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.streams.insert(
            name.clone(),
            StreamDesc {
                name,
                client_streaming,
                server_streaming,
                handler,
            },
        );
        self
    }

    /// Attach opaque metadata surfaced through introspection.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDesc> {
        self.methods.get(name)
    }

    pub fn stream_desc(&self, name: &str) -> Option<&StreamDesc> {
        self.streams.get(name)
    }

    /// Full paths of every unary method and stream.
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.methods
            .keys()
            .chain(self.streams.keys())
            .map(move |m| format!("/{}/{}", self.name, m))
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name.clone(),
            methods: self
                .methods
                .keys()
                .map(|name| (name.clone(), MethodInfo { name: name.clone() }))
                .collect(),
            streams: self
                .streams
                .values()
                .map(|s| {
                    (
                        s.name.clone(),
                        StreamInfo {
                            name: s.name.clone(),
                            client_streaming: s.client_streaming,
                            server_streaming: s.server_streaming,
                        },
                    )
                })
                .collect(),
            metadata: self.metadata.clone(),
        }
    }
}

async fn call_message<Req, Resp, F, Fut>(
    handler: Arc<F>,
    ctx: CallContext,
    bytes: Bytes,
) -> Result<Bytes, Status>
where
    Req: prost::Message + Default,
    Resp: prost::Message,
    F: Fn(CallContext, Req) -> Fut,
    Fut: Future<Output = Result<Resp, Status>>,
{
    let request = Req::decode(bytes)
        .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))?;
    let response = handler(ctx, request).await?;
    Ok(Bytes::from(response.encode_to_vec()))
}

impl fmt::Debug for ServiceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDesc")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Read-only description of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub methods: BTreeMap<String, MethodInfo>,
    pub streams: BTreeMap<String, StreamInfo>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}
