//! Sub-server serve loops.
//!
//! # Data Flow
//! ```text
//! VirtualListener::accept
//!     → ConnectionTracker::track (drain accounting)
//!     → connection.rs serve_connection (one task per connection)
//!     → Handler: gRPC content type → RpcServer, otherwise → axum Router
//! ```
//!
//! # Design Decisions
//! - A serve loop returns `ServerClosed` when stopped or draining and
//!   passes `ListenerClosed` through from its virtual listener; both are
//!   benign and never fail the task group
//! - Connections live on their own tasks so closing a loop does not cut
//!   in-flight requests; the phase channel decides when they end

pub mod connection;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::demux::VirtualListener;
use crate::error::ServeError;
use crate::lifecycle::PhaseWatch;
use crate::net::ConnectionTracker;

pub use connection::{serve_connection, Handler};

/// Accept from `listener` and serve each connection with `handler`.
pub async fn serve(
    mut listener: VirtualListener,
    handler: Handler,
    stop: CancellationToken,
    phase: PhaseWatch,
    connections: ConnectionTracker,
) -> Result<(), ServeError> {
    tracing::info!(
        server = listener.name(),
        address = %listener.local_addr(),
        ?handler,
        "Serving"
    );

    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => return Err(ServeError::ServerClosed),
            _ = phase.draining() => return Err(ServeError::ServerClosed),
            accepted = listener.accept() => accepted?,
        };

        let guard = connections.track();
        let span = tracing::debug_span!("connection", server = listener.name(), connection_id = %guard.id());
        let handler = handler.clone();
        let phase = phase.clone();
        tokio::spawn(
            async move {
                serve_connection(accepted, handler, phase).await;
                drop(guard);
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::Demux;
    use crate::lifecycle::PhaseController;
    use crate::net::{BindTarget, Listener};
    use crate::rpc::{Dispatcher, RpcServer, ServiceDesc, ServiceTable};
    use axum::routing::get;
    use axum::Router;
    use bytes::Bytes;
    use http::Request;
    use http_body_util::{BodyExt, Empty};
    use hyper_util::rt::TokioIo;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn combined_server(
        controller: &PhaseController,
    ) -> (std::net::SocketAddr, ConnectionTracker, tokio::task::JoinHandle<Result<(), ServeError>>) {
        let target: BindTarget = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&target, 16).await.unwrap();
        let addr = listener.local_addr().tcp().unwrap();
        let (demux, combined) = Demux::combined(listener, None, Duration::from_secs(1));
        tokio::spawn(demux.run(CancellationToken::new(), controller.watch()));

        let table = ServiceTable::new();
        table
            .register(ServiceDesc::new("echo.Echo").unary("Say", |_ctx, req| async move { Ok(req) }))
            .unwrap();
        table
            .transition(crate::lifecycle::RuntimeState::Created, crate::lifecycle::RuntimeState::Running)
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(table), Arc::default(), controller.watch());
        let rpc = RpcServer::new(dispatcher, CancellationToken::new());
        let router = Router::new().route("/hello", get(|| async { "hello" }));

        let tracker = ConnectionTracker::new();
        let task = tokio::spawn(serve(
            combined,
            Handler::new(Some(rpc), Some(router)),
            CancellationToken::new(),
            controller.watch(),
            tracker.clone(),
        ));
        (addr, tracker, task)
    }

    #[tokio::test]
    async fn plain_http_reaches_router() {
        let controller = PhaseController::new();
        let (addr, _tracker, _task) = combined_server(&controller).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = Request::get("/hello")
            .header("host", "localhost")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let request = Request::get("/missing")
            .header("host", "localhost")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn draining_closes_loop_and_idle_connections() {
        let controller = PhaseController::new();
        let (addr, tracker, task) = combined_server(&controller).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        let client_conn = tokio::spawn(conn);
        let request = Request::get("/hello")
            .header("host", "localhost")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(sender.send_request(request).await.unwrap().status(), 200);
        assert_eq!(tracker.active_count(), 1);

        controller.drain();
        let exit = task.await.unwrap().unwrap_err();
        assert!(exit.is_benign());

        tokio::time::timeout(Duration::from_secs(2), tracker.wait_idle())
            .await
            .expect("idle keep-alive connection should close on drain");
        let _ = tokio::time::timeout(Duration::from_secs(2), client_conn).await;
    }

    #[tokio::test]
    async fn handler_without_http_answers_not_found() {
        let handler = Handler::default();
        assert!(!handler.serves_rpc());
        assert!(!handler.serves_http());
        let response = handler
            .handle(Request::get("/").body(axum::body::Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), 404);
    }
}
