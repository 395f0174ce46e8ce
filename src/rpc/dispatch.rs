//! Call dispatch shared by the network and in-process channels.
//!
//! # Responsibilities
//! - Resolve a method path against the [`ServiceTable`]
//! - Run the server-side interceptor chains, then the handler
//! - Refuse new calls once draining; abandon in-flight calls once terminated
//! - Track in-flight calls so shutdown can wait for them
//!
//! Both channels hold a clone of the same [`Dispatcher`], so they share one
//! table and one [`Pipeline`] by construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};

use crate::lifecycle::PhaseWatch;
use crate::net::{ConnectionGuard, ConnectionTracker};
use crate::observability::metrics;
use crate::rpc::descriptor::MessageStream;
use crate::rpc::interceptor::Pipeline;
use crate::rpc::table::{Route, ServiceTable};
use crate::rpc::{CallContext, Code, Status};

/// Shape of a resolved method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    Stream,
}

#[derive(Clone)]
pub struct Dispatcher {
    table: Arc<ServiceTable>,
    pipeline: Arc<Pipeline>,
    phase: PhaseWatch,
    calls: ConnectionTracker,
}

impl Dispatcher {
    pub fn new(table: Arc<ServiceTable>, pipeline: Arc<Pipeline>, phase: PhaseWatch) -> Self {
        Self {
            table,
            pipeline,
            phase,
            calls: ConnectionTracker::new(),
        }
    }

    pub fn table(&self) -> &Arc<ServiceTable> {
        &self.table
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn phase(&self) -> &PhaseWatch {
        &self.phase
    }

    /// In-flight call accounting.
    pub fn calls(&self) -> &ConnectionTracker {
        &self.calls
    }

    pub fn kind(&self, path: &str) -> Option<MethodKind> {
        self.table.route(path).map(|route| match route {
            Route::Unary(_) => MethodKind::Unary,
            Route::Stream(_) => MethodKind::Stream,
        })
    }

    /// Dispatch a unary call through the server chain.
    pub async fn unary(&self, ctx: CallContext, request: Bytes) -> Result<Bytes, Status> {
        let start = Instant::now();
        let method = ctx.method().to_string();
        let origin = ctx.origin();

        let result = self.unary_inner(ctx, request).await;

        let code = result.as_ref().err().map_or(Code::Ok, Status::code);
        metrics::record_call(&method, origin, code, start);
        result
    }

    async fn unary_inner(&self, ctx: CallContext, request: Bytes) -> Result<Bytes, Status> {
        self.admit()?;
        let handler = match self.table.route(ctx.method()) {
            Some(Route::Unary(handler)) => handler,
            Some(Route::Stream(_)) => {
                return Err(Status::unimplemented(format!(
                    "{} is a streaming method",
                    ctx.method()
                )))
            }
            None => return Err(unknown_method(ctx.method())),
        };

        let _guard = self.calls.track();
        let token = ctx.cancellation().clone();
        let call = self.pipeline.unary_server.call(handler, ctx, request);

        tokio::select! {
            result = call => result,
            _ = self.phase.terminated() => {
                token.cancel();
                Err(terminated())
            }
        }
    }

    /// Dispatch a streaming call through the server chain.
    ///
    /// The call stays in flight until the returned stream is dropped or
    /// exhausted.
    pub async fn stream(&self, ctx: CallContext, input: MessageStream) -> Result<MessageStream, Status> {
        let start = Instant::now();
        let method = ctx.method().to_string();
        let origin = ctx.origin();

        let result = self.stream_inner(ctx, input).await;

        let code = result.as_ref().err().map_or(Code::Ok, Status::code);
        metrics::record_call(&method, origin, code, start);
        result
    }

    async fn stream_inner(&self, ctx: CallContext, input: MessageStream) -> Result<MessageStream, Status> {
        self.admit()?;
        let desc = match self.table.route(ctx.method()) {
            Some(Route::Stream(desc)) => desc,
            Some(Route::Unary(_)) => {
                return Err(Status::unimplemented(format!(
                    "{} is a unary method",
                    ctx.method()
                )))
            }
            None => return Err(unknown_method(ctx.method())),
        };

        let guard = self.calls.track();
        let token = ctx.cancellation().clone();
        let call = self.pipeline.stream_server.call(desc.handler, ctx, input);

        let output = tokio::select! {
            result = call => result?,
            _ = self.phase.terminated() => {
                token.cancel();
                return Err(terminated());
            }
        };

        let phase = self.phase.clone();
        Ok(Guarded {
            inner: output,
            terminated: async move { phase.terminated().await }.boxed(),
            token,
            done: false,
            _guard: guard,
        }
        .boxed())
    }

    fn admit(&self) -> Result<(), Status> {
        if self.phase.is_serving() {
            Ok(())
        } else {
            Err(Status::unavailable("server is shutting down"))
        }
    }
}

fn unknown_method(path: &str) -> Status {
    Status::unimplemented(format!("unknown method {path}"))
}

fn terminated() -> Status {
    Status::unavailable("call terminated by shutdown")
}

/// Output stream that keeps its call counted as in flight and ends with
/// `UNAVAILABLE` if the runtime is force-terminated first.
struct Guarded {
    inner: MessageStream,
    terminated: BoxFuture<'static, ()>,
    token: tokio_util::sync::CancellationToken,
    done: bool,
    _guard: ConnectionGuard,
}

impl Stream for Guarded {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.terminated.as_mut().poll(cx).is_ready() {
            self.done = true;
            self.token.cancel();
            return Poll::Ready(Some(Err(terminated())));
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
