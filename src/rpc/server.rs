//! RPC request handling over HTTP.
//!
//! # Responsibilities
//! - Recognize gRPC and gRPC-Web requests by content type
//! - Build the [`CallContext`] from request headers and connection info
//! - Decode framed request messages, dispatch, and frame the response with
//!   a status trailer
//!
//! Network calls go straight to the [`Dispatcher`]; the web bridge goes
//! through the in-process [`Invoker`]. Both share [`handle`].

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::StreamBody;
use hyper::body::Frame;
use tokio_util::sync::CancellationToken;

use crate::net::PeerAddr;
use crate::rpc::descriptor::MessageStream;
use crate::rpc::dispatch::{Dispatcher, MethodKind};
use crate::rpc::frame::{self, response_frames, trailer_frame};
use crate::rpc::invoker::Invoker;
use crate::rpc::{CallContext, CallOrigin, Status};

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web+proto";

/// Whether `headers` describe a native gRPC request.
pub fn is_grpc(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| {
        ct.starts_with(GRPC_CONTENT_TYPE) && !ct.starts_with("application/grpc-web")
    })
}

/// Whether `headers` describe a binary gRPC-Web request.
pub fn is_grpc_web(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| {
        ct == "application/grpc-web" || ct.starts_with("application/grpc-web+")
    })
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// A channel calls can be sent down.
pub(crate) trait CallTarget: Send + Sync {
    fn origin(&self) -> CallOrigin;

    fn kind(&self, path: &str) -> Option<MethodKind>;

    fn unary(&self, ctx: CallContext, request: Bytes) -> BoxFuture<'_, Result<Bytes, Status>>;

    fn stream(&self, ctx: CallContext, input: MessageStream) -> BoxFuture<'_, Result<MessageStream, Status>>;
}

impl CallTarget for Dispatcher {
    fn origin(&self) -> CallOrigin {
        CallOrigin::Network
    }

    fn kind(&self, path: &str) -> Option<MethodKind> {
        Dispatcher::kind(self, path)
    }

    fn unary(&self, ctx: CallContext, request: Bytes) -> BoxFuture<'_, Result<Bytes, Status>> {
        Dispatcher::unary(self, ctx, request).boxed()
    }

    fn stream(&self, ctx: CallContext, input: MessageStream) -> BoxFuture<'_, Result<MessageStream, Status>> {
        Dispatcher::stream(self, ctx, input).boxed()
    }
}

impl CallTarget for Invoker {
    fn origin(&self) -> CallOrigin {
        CallOrigin::InProcess
    }

    fn kind(&self, path: &str) -> Option<MethodKind> {
        self.dispatcher().kind(path)
    }

    fn unary(&self, ctx: CallContext, request: Bytes) -> BoxFuture<'_, Result<Bytes, Status>> {
        Invoker::call(self, ctx, request).boxed()
    }

    fn stream(&self, ctx: CallContext, input: MessageStream) -> BoxFuture<'_, Result<MessageStream, Status>> {
        Invoker::stream(self, ctx, input).boxed()
    }
}

/// Network-facing RPC server.
#[derive(Clone)]
pub struct RpcServer {
    dispatcher: Dispatcher,
    context: CancellationToken,
}

impl RpcServer {
    pub fn new(dispatcher: Dispatcher, context: CancellationToken) -> Self {
        Self {
            dispatcher,
            context,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve one gRPC request.
    pub async fn serve(&self, request: Request<Body>) -> Response<Body> {
        let path = request.uri().path().to_string();
        handle(&self.dispatcher, self.context.child_token(), path, request, false).await
    }
}

/// Serve one framed request for method `path` through `target`.
pub(crate) async fn handle<T: CallTarget>(
    target: &T,
    cancellation: CancellationToken,
    path: String,
    request: Request<Body>,
    web: bool,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let peer = parts.extensions.get::<PeerAddr>().copied();
    let timeout = parts.headers.get("grpc-timeout").and_then(parse_timeout);

    let ctx = CallContext::new(path.clone(), target.origin())
        .with_metadata(parts.headers)
        .with_peer(peer)
        .with_cancellation(cancellation);

    match target.kind(&path) {
        Some(MethodKind::Stream) => {
            let input = frame::decode_body(body);
            match target.stream(ctx.clone(), input).await {
                Ok(output) => respond(&ctx, web, response_frames(output, web)),
                Err(status) => respond(&ctx, web, finished(Err(status), web)),
            }
        }
        // Unknown methods take the unary path so the dispatcher reports them.
        Some(MethodKind::Unary) | None => {
            let result = match frame::read_unary(body).await {
                Ok(message) => call_unary(target, ctx.clone(), message, timeout).await,
                Err(status) => Err(status),
            };
            match result.and_then(|reply| frame::encode(&reply)) {
                Ok(reply) => {
                    let frames = futures_util::stream::iter([
                        Ok(Frame::data(reply)),
                        Ok(trailer_frame(Ok(()), web)),
                    ]);
                    respond(&ctx, web, frames)
                }
                Err(status) => respond(&ctx, web, finished(Err(status), web)),
            }
        }
    }
}

async fn call_unary<T: CallTarget>(
    target: &T,
    ctx: CallContext,
    message: Bytes,
    timeout: Option<Duration>,
) -> Result<Bytes, Status> {
    let token = ctx.cancellation().clone();
    let call = target.unary(ctx, message);
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(Status::new(crate::rpc::Code::DeadlineExceeded, "deadline exceeded"))
            }
        },
        None => call.await,
    }
}

fn finished(
    result: Result<(), Status>,
    web: bool,
) -> impl Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
    futures_util::stream::iter([Ok(trailer_frame(result, web))])
}

fn respond<S>(ctx: &CallContext, web: bool, frames: S) -> Response<Body>
where
    S: Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static,
{
    let mut response = Response::new(Body::new(StreamBody::new(frames)));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    headers.extend(ctx.response_headers());
    let content_type = if web {
        GRPC_WEB_CONTENT_TYPE
    } else {
        GRPC_CONTENT_TYPE
    };
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Parse a `grpc-timeout` value such as `100m` or `5S`.
fn parse_timeout(value: &HeaderValue) -> Option<Duration> {
    let value = value.to_str().ok()?;
    if value.is_empty() || value.len() > 9 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}
