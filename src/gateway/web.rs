//! gRPC-Web bridge.
//!
//! Browsers cannot speak native gRPC, so every registered method is also
//! mounted as a plain HTTP route that accepts gRPC-Web framing. Calls run on
//! the in-process channel and are answered with a gRPC-Web body whose final
//! frame carries the trailers.

use axum::body::Body;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use http::{Request, Response, StatusCode};

use crate::rpc::server::{handle, is_grpc_web, GRPC_WEB_CONTENT_TYPE};
use crate::rpc::Invoker;

/// One POST route per method path, under `prefix` (empty for root).
pub fn bridge(prefix: &str, paths: Vec<String>, invoker: Invoker) -> Router {
    let mut router = Router::new();
    for path in paths {
        let route = format!("{prefix}{path}");
        let invoker = invoker.clone();
        router = router.route(
            &route,
            post(move |request: Request<Body>| {
                let invoker = invoker.clone();
                let method = path.clone();
                async move { call(invoker, method, request).await }
            }),
        );
        tracing::debug!(route = %route, "Web bridge route mounted");
    }
    router
}

async fn call(invoker: Invoker, method: String, request: Request<Body>) -> Response<Body> {
    if !is_grpc_web(request.headers()) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("expected {GRPC_WEB_CONTENT_TYPE}"),
        )
            .into_response();
    }
    let cancellation = invoker.cancellation();
    handle(&invoker, cancellation, method, request, true).await
}
