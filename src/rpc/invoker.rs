//! In-process call channel.
//!
//! An [`Invoker`] reaches registered handlers without a network hop. Calls
//! pass the client chains first, then the same [`Dispatcher`] the network
//! server uses, so server-side interceptors observe identical behavior on
//! both channels.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::rpc::descriptor::{MessageStream, StreamHandler, UnaryHandler};
use crate::rpc::dispatch::Dispatcher;
use crate::rpc::{CallContext, CallOrigin, Status};

#[derive(Clone)]
pub struct Invoker {
    dispatcher: Dispatcher,
    context: CancellationToken,
    unary_endpoint: UnaryHandler,
    stream_endpoint: StreamHandler,
}

impl Invoker {
    /// `context` is the runtime context; every call gets a child of it.
    pub fn new(dispatcher: Dispatcher, context: CancellationToken) -> Self {
        let unary_endpoint: UnaryHandler = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |ctx, request| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.unary(ctx, request).await }.boxed()
            })
        };
        let stream_endpoint: StreamHandler = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |ctx, input| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.stream(ctx, input).await }.boxed()
            })
        };

        Self {
            dispatcher,
            context,
            unary_endpoint,
            stream_endpoint,
        }
    }

    /// Fresh in-process context for `method`.
    pub fn context(&self, method: &str) -> CallContext {
        CallContext::new(method.to_string(), CallOrigin::InProcess)
            .with_cancellation(self.cancellation())
    }

    /// Per-call cancellation token, a child of the runtime context.
    pub fn cancellation(&self) -> CancellationToken {
        self.context.child_token()
    }

    /// Call a unary method with raw encoded messages.
    pub async fn unary(&self, method: &str, metadata: HeaderMap, request: Bytes) -> Result<Bytes, Status> {
        self.call(self.context(method).with_metadata(metadata), request)
            .await
    }

    /// Call a unary method with a prepared context.
    pub async fn call(&self, ctx: CallContext, request: Bytes) -> Result<Bytes, Status> {
        self.dispatcher
            .pipeline()
            .unary_client
            .call(Arc::clone(&self.unary_endpoint), ctx, request)
            .await
    }

    /// Call a unary method with protobuf messages.
    pub async fn call_message<Req, Resp>(
        &self,
        method: &str,
        metadata: HeaderMap,
        request: &Req,
    ) -> Result<Resp, Status>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let reply = self
            .unary(method, metadata, Bytes::from(request.encode_to_vec()))
            .await?;
        Resp::decode(reply).map_err(|e| Status::internal(format!("malformed response: {e}")))
    }

    /// Open a stream with a prepared context.
    pub async fn stream(&self, ctx: CallContext, input: MessageStream) -> Result<MessageStream, Status> {
        self.dispatcher
            .pipeline()
            .stream_client
            .call(Arc::clone(&self.stream_endpoint), ctx, input)
            .await
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("pipeline", self.dispatcher.pipeline())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PhaseController;
    use crate::rpc::descriptor::ServiceDesc;
    use crate::rpc::interceptor::{unary_fn, InterceptorSet, Interceptors, Pipeline, UnaryNext};
    use crate::rpc::table::ServiceTable;
    use crate::rpc::Code;
    use http::HeaderValue;
    use std::sync::Mutex;

    #[tokio::test]
    async fn client_chain_runs_before_server_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let client = {
            let log = log.clone();
            unary_fn(move |mut ctx: CallContext, req, next: UnaryNext| {
                log.lock().unwrap().push("client");
                ctx.metadata_mut()
                    .insert("authorization", HeaderValue::from_static("Bearer t"));
                next.run(ctx, req)
            })
        };
        let server = {
            let log = log.clone();
            unary_fn(move |ctx: CallContext, req, next: UnaryNext| {
                log.lock().unwrap().push("server");
                let authorized = ctx.metadata().contains_key("authorization");
                async move {
                    if !authorized {
                        return Err(Status::unauthenticated("missing token"));
                    }
                    next.run(ctx, req).await
                }
            })
        };
        let collaborators: Vec<Arc<dyn Interceptors>> = vec![Arc::new(
            InterceptorSet::default()
                .with_unary_client(client)
                .with_unary_server(server),
        )];

        let table = ServiceTable::new();
        table
            .register(ServiceDesc::new("echo.Echo").unary("Say", |ctx, req| async move {
                assert_eq!(ctx.origin(), CallOrigin::InProcess);
                Ok(req)
            }))
            .unwrap();
        let controller = PhaseController::new();
        let dispatcher = Dispatcher::new(
            Arc::new(table),
            Arc::new(Pipeline::assemble(&collaborators)),
            controller.watch(),
        );
        let invoker = Invoker::new(dispatcher, CancellationToken::new());

        let reply = invoker
            .unary("/echo.Echo/Say", HeaderMap::new(), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
        assert_eq!(*log.lock().unwrap(), vec!["client", "server"]);

        let err = invoker
            .unary("/echo.Echo/Missing", HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
    }

    #[tokio::test]
    async fn call_context_inherits_runtime_cancellation() {
        let controller = PhaseController::new();
        let dispatcher = Dispatcher::new(Arc::default(), Arc::default(), controller.watch());
        let runtime_context = CancellationToken::new();
        let invoker = Invoker::new(dispatcher, runtime_context.clone());

        let ctx = invoker.context("/a.B/C");
        assert!(!ctx.is_cancelled());
        runtime_context.cancel();
        assert!(ctx.is_cancelled());
    }
}
