//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use rpc_runtime::rpc::frame::{self, FrameDecoder};
use rpc_runtime::{Runtime, RuntimeConfig, ServiceDesc, Status};

pub type GrpcClient = Client<HttpConnector, Full<Bytes>>;

/// Config bound to an ephemeral loopback port with OS signals off.
pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.service.name = "echo".into();
    config.service.version = "1.0.0".into();
    config.listener.address = "127.0.0.1:0".into();
    config.shutdown.handle_signals = false;
    config.shutdown.drain_timeout_ms = 2_000;
    config
}

/// `echo.Echo` with `Say` (echo), `Slow` (sleeps, then echoes), `Fail`
/// and the bidirectional `Chat` (echoes every message).
pub fn echo_service(slow: Duration) -> ServiceDesc {
    ServiceDesc::new("echo.Echo")
        .unary("Say", |_ctx, request| async move { Ok(request) })
        .unary("Slow", move |_ctx, request| async move {
            tokio::time::sleep(slow).await;
            Ok(request)
        })
        .unary("Fail", |_ctx, _request| async move {
            Err::<Bytes, _>(Status::not_found("nothing here"))
        })
        .stream("Chat", true, true, |_ctx, input| async move { Ok(input) })
}

pub fn addr(runtime: &Runtime) -> SocketAddr {
    runtime
        .local_addr()
        .and_then(|local| local.tcp())
        .expect("runtime bound to TCP")
}

/// Prior-knowledge HTTP/2 client, as gRPC clients connect.
pub fn grpc_client() -> GrpcClient {
    Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build_http()
}

/// Result of a gRPC call as seen on the wire.
#[derive(Debug)]
pub struct GrpcReply {
    pub headers: HeaderMap,
    pub messages: Vec<Bytes>,
    pub status: Result<(), Status>,
}

pub async fn grpc_unary(
    client: &GrpcClient,
    addr: SocketAddr,
    method: &str,
    metadata: &[(&str, &str)],
    message: &[u8],
) -> GrpcReply {
    grpc_call(client, addr, method, metadata, &[message]).await
}

/// Send every message in one request body and read the whole reply.
pub async fn grpc_call(
    client: &GrpcClient,
    addr: SocketAddr,
    method: &str,
    metadata: &[(&str, &str)],
    messages: &[&[u8]],
) -> GrpcReply {
    let mut builder = Request::post(format!("http://{addr}{method}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    for (name, value) in metadata {
        builder = builder.header(*name, *value);
    }
    let body: Vec<u8> = messages
        .iter()
        .flat_map(|message| frame::encode(message).unwrap())
        .collect();
    let request = builder.body(Full::new(Bytes::from(body))).unwrap();

    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let collected = body.collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    let data = collected.to_bytes();

    let mut decoder = FrameDecoder::default();
    decoder.push(&data);
    let mut messages = Vec::new();
    while let Some(message) = decoder.next_message().unwrap() {
        messages.push(message);
    }

    // Trailers-only responses carry the status in the headers.
    let status = trailers
        .as_ref()
        .and_then(Status::from_headers)
        .or_else(|| Status::from_headers(&parts.headers))
        .expect("grpc-status present");

    GrpcReply {
        headers: parts.headers,
        messages,
        status,
    }
}
