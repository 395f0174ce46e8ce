//! Interceptor chains.
//!
//! # Data Flow
//! ```text
//! network call:     server chain[0] → server chain[1] → … → handler
//! in-process call:  client chain[0] → … → dispatcher → server chain[0] → … → handler
//! ```
//!
//! # Design Decisions
//! - Order is exactly the order collaborators were supplied; nothing is
//!   reordered or deduplicated
//! - The [`Pipeline`] is assembled once and shared by both call channels
//! - Each interceptor receives the remainder of the chain as a `Next` value
//!   and decides whether (and with what) to continue

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;

use crate::rpc::descriptor::{MessageStream, StreamFuture, StreamHandler, UnaryFuture, UnaryHandler};
use crate::rpc::CallContext;

/// Wraps unary calls.
pub trait UnaryInterceptor: Send + Sync + 'static {
    fn intercept(&self, ctx: CallContext, request: Bytes, next: UnaryNext) -> UnaryFuture;
}

/// Wraps streaming calls. Runs once per stream, before the handler starts.
pub trait StreamInterceptor: Send + Sync + 'static {
    fn intercept(&self, ctx: CallContext, input: MessageStream, next: StreamNext) -> StreamFuture;
}

pub type SharedUnary = Arc<dyn UnaryInterceptor>;
pub type SharedStream = Arc<dyn StreamInterceptor>;

struct UnaryFn<F>(F);

impl<F, Fut> UnaryInterceptor for UnaryFn<F>
where
    F: Fn(CallContext, Bytes, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, crate::rpc::Status>> + Send + 'static,
{
    fn intercept(&self, ctx: CallContext, request: Bytes, next: UnaryNext) -> UnaryFuture {
        (self.0)(ctx, request, next).boxed()
    }
}

struct StreamFn<F>(F);

impl<F, Fut> StreamInterceptor for StreamFn<F>
where
    F: Fn(CallContext, MessageStream, StreamNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MessageStream, crate::rpc::Status>> + Send + 'static,
{
    fn intercept(&self, ctx: CallContext, input: MessageStream, next: StreamNext) -> StreamFuture {
        (self.0)(ctx, input, next).boxed()
    }
}

/// Build a unary interceptor from an async closure.
///
/// ```ignore
/// let log = unary_fn(|ctx, req, next: UnaryNext| async move {
///     tracing::info!(method = ctx.method(), "Call");
///     next.run(ctx, req).await
/// });
/// ```
pub fn unary_fn<F, Fut>(f: F) -> SharedUnary
where
    F: Fn(CallContext, Bytes, UnaryNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, crate::rpc::Status>> + Send + 'static,
{
    Arc::new(UnaryFn(f))
}

/// Build a stream interceptor from an async closure.
pub fn stream_fn<F, Fut>(f: F) -> SharedStream
where
    F: Fn(CallContext, MessageStream, StreamNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MessageStream, crate::rpc::Status>> + Send + 'static,
{
    Arc::new(StreamFn(f))
}

/// Remainder of a unary chain.
#[derive(Clone)]
pub struct UnaryNext {
    chain: Arc<[SharedUnary]>,
    index: usize,
    endpoint: UnaryHandler,
}

impl UnaryNext {
    /// Invoke the next interceptor, or the endpoint once the chain is exhausted.
    pub fn run(self, ctx: CallContext, request: Bytes) -> UnaryFuture {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = UnaryNext {
                    index: self.index + 1,
                    ..self
                };
                interceptor.intercept(ctx, request, next)
            }
            None => (self.endpoint)(ctx, request),
        }
    }
}

/// Remainder of a stream chain.
#[derive(Clone)]
pub struct StreamNext {
    chain: Arc<[SharedStream]>,
    index: usize,
    endpoint: StreamHandler,
}

impl StreamNext {
    pub fn run(self, ctx: CallContext, input: MessageStream) -> StreamFuture {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                let next = StreamNext {
                    index: self.index + 1,
                    ..self
                };
                interceptor.intercept(ctx, input, next)
            }
            None => (self.endpoint)(ctx, input),
        }
    }
}

/// An ordered, immutable unary chain.
#[derive(Clone)]
pub struct UnaryChain {
    interceptors: Arc<[SharedUnary]>,
}

impl Default for UnaryChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl UnaryChain {
    pub fn new(interceptors: Vec<SharedUnary>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `request` through the chain, ending at `endpoint`.
    pub fn call(&self, endpoint: UnaryHandler, ctx: CallContext, request: Bytes) -> UnaryFuture {
        UnaryNext {
            chain: Arc::clone(&self.interceptors),
            index: 0,
            endpoint,
        }
        .run(ctx, request)
    }
}

/// An ordered, immutable stream chain.
#[derive(Clone)]
pub struct StreamChain {
    interceptors: Arc<[SharedStream]>,
}

impl Default for StreamChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StreamChain {
    pub fn new(interceptors: Vec<SharedStream>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn call(&self, endpoint: StreamHandler, ctx: CallContext, input: MessageStream) -> StreamFuture {
        StreamNext {
            chain: Arc::clone(&self.interceptors),
            index: 0,
            endpoint,
        }
        .run(ctx, input)
    }
}

/// A collaborator contributing up to four interceptors. Absent slots are
/// skipped.
pub trait Interceptors: Send + Sync {
    fn unary_server(&self) -> Option<SharedUnary> {
        None
    }

    fn stream_server(&self) -> Option<SharedStream> {
        None
    }

    fn unary_client(&self) -> Option<SharedUnary> {
        None
    }

    fn stream_client(&self) -> Option<SharedStream> {
        None
    }
}

/// Plain-data [`Interceptors`] for callers that have loose functions
/// rather than a collaborator type.
#[derive(Clone, Default)]
pub struct InterceptorSet {
    pub unary_server: Option<SharedUnary>,
    pub stream_server: Option<SharedStream>,
    pub unary_client: Option<SharedUnary>,
    pub stream_client: Option<SharedStream>,
}

impl InterceptorSet {
    pub fn with_unary_server(mut self, interceptor: SharedUnary) -> Self {
        self.unary_server = Some(interceptor);
        self
    }

    pub fn with_stream_server(mut self, interceptor: SharedStream) -> Self {
        self.stream_server = Some(interceptor);
        self
    }

    pub fn with_unary_client(mut self, interceptor: SharedUnary) -> Self {
        self.unary_client = Some(interceptor);
        self
    }

    pub fn with_stream_client(mut self, interceptor: SharedStream) -> Self {
        self.stream_client = Some(interceptor);
        self
    }
}

impl Interceptors for InterceptorSet {
    fn unary_server(&self) -> Option<SharedUnary> {
        self.unary_server.clone()
    }

    fn stream_server(&self) -> Option<SharedStream> {
        self.stream_server.clone()
    }

    fn unary_client(&self) -> Option<SharedUnary> {
        self.unary_client.clone()
    }

    fn stream_client(&self) -> Option<SharedStream> {
        self.stream_client.clone()
    }
}

/// The four assembled chains.
#[derive(Clone, Default)]
pub struct Pipeline {
    pub unary_server: UnaryChain,
    pub stream_server: StreamChain,
    pub unary_client: UnaryChain,
    pub stream_client: StreamChain,
}

impl Pipeline {
    /// Assemble chains from collaborators, preserving their order.
    pub fn assemble<'a, I>(collaborators: I) -> Self
    where
        I: IntoIterator<Item = &'a Arc<dyn Interceptors>>,
    {
        let mut unary_server = Vec::new();
        let mut stream_server = Vec::new();
        let mut unary_client = Vec::new();
        let mut stream_client = Vec::new();

        for collaborator in collaborators {
            unary_server.extend(collaborator.unary_server());
            stream_server.extend(collaborator.stream_server());
            unary_client.extend(collaborator.unary_client());
            stream_client.extend(collaborator.stream_client());
        }

        Self {
            unary_server: UnaryChain::new(unary_server),
            stream_server: StreamChain::new(stream_server),
            unary_client: UnaryChain::new(unary_client),
            stream_client: StreamChain::new(stream_client),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("unary_server", &self.unary_server.len())
            .field("stream_server", &self.stream_server.len())
            .field("unary_client", &self.unary_client.len())
            .field("stream_client", &self.stream_client.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{CallOrigin, Code, Status};
    use futures_util::StreamExt;
    use std::sync::Mutex;

    fn tagging(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> SharedUnary {
        let log = log.clone();
        unary_fn(move |ctx, req, next: UnaryNext| {
            log.lock().unwrap().push(tag.to_string());
            next.run(ctx, req)
        })
    }

    fn echo() -> UnaryHandler {
        Arc::new(|_ctx, req| Box::pin(async move { Ok(req) }))
    }

    fn ctx() -> CallContext {
        CallContext::new("/test.Svc/Call", CallOrigin::InProcess)
    }

    #[tokio::test]
    async fn preserves_supplied_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let collaborators: Vec<Arc<dyn Interceptors>> = vec![
            Arc::new(InterceptorSet::default().with_unary_server(tagging(&log, "identity"))),
            Arc::new(InterceptorSet::default()),
            Arc::new(InterceptorSet::default().with_unary_server(tagging(&log, "ratelimit"))),
            Arc::new(InterceptorSet::default().with_unary_server(tagging(&log, "auth"))),
        ];
        let pipeline = Pipeline::assemble(&collaborators);
        assert_eq!(pipeline.unary_server.len(), 3);
        assert!(pipeline.unary_client.is_empty());

        let reply = pipeline
            .unary_server
            .call(echo(), ctx(), Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"x"));
        assert_eq!(*log.lock().unwrap(), vec!["identity", "ratelimit", "auth"]);
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let deny = unary_fn(|_ctx, _req, _next: UnaryNext| async move {
            Err::<Bytes, _>(Status::unauthenticated("missing token"))
        });
        let reached = Arc::new(Mutex::new(false));
        let flag = reached.clone();
        let endpoint: UnaryHandler = Arc::new(move |_ctx, req| {
            *flag.lock().unwrap() = true;
            Box::pin(async move { Ok(req) })
        });

        let chain = UnaryChain::new(vec![deny]);
        let err = chain.call(endpoint, ctx(), Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn stream_chain_wraps_output() {
        let upper = stream_fn(|ctx, input, next: StreamNext| async move {
            let output = match next.run(ctx, input).await {
                Ok(output) => output,
                Err(status) => return Err(status),
            };
            Ok(output
                .map(|item| item.map(|b| Bytes::from(b.to_ascii_uppercase())))
                .boxed())
        });
        let endpoint: StreamHandler = Arc::new(|_ctx, input| Box::pin(async move { Ok(input) }));

        let input = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))]).boxed();
        let output = StreamChain::new(vec![upper])
            .call(endpoint, ctx(), input)
            .await
            .unwrap();
        let items: Vec<_> = output.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")]);
    }
}
