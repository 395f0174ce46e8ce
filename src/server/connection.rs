//! Per-connection serving.
//!
//! One hyper-util auto connection (HTTP/1.1 or HTTP/2) per accepted stream.
//! Requests carrying a native gRPC content type go to the RPC server, the
//! rest to the HTTP router.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::IntoResponse;
use axum::Router;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tower::ServiceExt;

use crate::demux::Accepted;
use crate::lifecycle::PhaseWatch;
use crate::rpc::server::is_grpc;
use crate::rpc::RpcServer;

/// Request router for one sub-server.
#[derive(Clone, Default)]
pub struct Handler {
    rpc: Option<RpcServer>,
    http: Option<Router>,
}

impl Handler {
    pub fn new(rpc: Option<RpcServer>, http: Option<Router>) -> Self {
        Self { rpc, http }
    }

    pub fn serves_rpc(&self) -> bool {
        self.rpc.is_some()
    }

    pub fn serves_http(&self) -> bool {
        self.http.is_some()
    }

    pub async fn handle(&self, request: Request<Body>) -> Response<Body> {
        if let Some(rpc) = &self.rpc {
            if is_grpc(request.headers()) {
                return rpc.serve(request).await;
            }
        }

        match &self.http {
            Some(router) => match router.clone().oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("rpc", &self.rpc.is_some())
            .field("http", &self.http.is_some())
            .finish()
    }
}

/// Serve `accepted` until the peer goes away or the phase ends it.
///
/// Draining asks the connection to finish in-flight requests and close
/// (GOAWAY on HTTP/2, `Connection: close` on HTTP/1.1). Terminated drops it.
pub async fn serve_connection(accepted: Accepted, handler: Handler, phase: PhaseWatch) {
    let Accepted { io, peer, permit } = accepted;

    let service = service_fn(move |request: Request<Incoming>| {
        let handler = handler.clone();
        async move {
            let mut request = request.map(Body::new);
            request.extensions_mut().insert(peer);
            if let Some(addr) = peer.socket_addr() {
                request
                    .extensions_mut()
                    .insert(ConnectInfo::<SocketAddr>(addr));
            }
            Ok::<_, Infallible>(handler.handle(request).await)
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            finished(res, &peer);
            return;
        }
        _ = phase.draining() => {
            tracing::trace!(peer_addr = %peer, "Draining connection");
            conn.as_mut().graceful_shutdown();
        }
    }

    tokio::select! {
        res = conn.as_mut() => finished(res, &peer),
        _ = phase.terminated() => {
            tracing::debug!(peer_addr = %peer, "Connection terminated");
        }
    }

    drop(permit);
}

fn finished(res: Result<(), Box<dyn std::error::Error + Send + Sync>>, peer: &crate::net::PeerAddr) {
    if let Err(e) = res {
        tracing::debug!(peer_addr = %peer, error = %e, "Connection closed with error");
    }
}
