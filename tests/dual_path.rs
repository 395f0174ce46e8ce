//! Network and in-process channels, demultiplexing, gateway and gRPC-Web.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use bytes::{Buf, Bytes};
use http::{HeaderMap, HeaderValue, StatusCode};
use prost::Message;

use common::{addr, echo_service, grpc_call, grpc_client, grpc_unary, test_config};
use rpc_runtime::rpc::frame;
use rpc_runtime::rpc::health::{HealthCheckRequest, HealthCheckResponse, ServingStatus};
use rpc_runtime::rpc::{unary_fn, InterceptorSet, UnaryNext};
use rpc_runtime::{CallContext, CallOrigin, Code, Invoker, Runtime, RuntimeConfig, Status};

/// Rejects calls without `authorization: Bearer secret`, recording the
/// origin of every call it sees.
fn auth(seen: Arc<Mutex<Vec<CallOrigin>>>) -> Arc<InterceptorSet> {
    Arc::new(InterceptorSet::default().with_unary_server(unary_fn(
        move |ctx: CallContext, request: Bytes, next: UnaryNext| {
            seen.lock().unwrap().push(ctx.origin());
            let authorized = ctx
                .metadata()
                .get("authorization")
                .is_some_and(|v| v == "Bearer secret");
            async move {
                if authorized {
                    next.run(ctx, request).await
                } else {
                    Err(Status::unauthenticated("missing credentials"))
                }
            }
        },
    )))
}

async fn started(config: RuntimeConfig, build: impl FnOnce(rpc_runtime::RuntimeBuilder) -> rpc_runtime::RuntimeBuilder) -> Runtime {
    let runtime = build(Runtime::builder(config)).build().unwrap();
    runtime.register_service(echo_service(Duration::ZERO)).unwrap();
    runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn interceptors_behave_identically_on_both_channels() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let runtime = started(test_config(), |b| b.interceptors(auth(Arc::clone(&seen)))).await;
    let client = grpc_client();
    let target = addr(&runtime);
    let invoker = runtime.invoker();

    let denied = grpc_unary(&client, target, "/echo.Echo/Say", &[], b"hi").await;
    assert_eq!(denied.status.unwrap_err().code(), Code::Unauthenticated);
    let denied = invoker
        .unary("/echo.Echo/Say", HeaderMap::new(), Bytes::from_static(b"hi"))
        .await
        .unwrap_err();
    assert_eq!(denied.code(), Code::Unauthenticated);

    let allowed = grpc_unary(
        &client,
        target,
        "/echo.Echo/Say",
        &[("authorization", "Bearer secret")],
        b"hi",
    )
    .await;
    assert!(allowed.status.is_ok());
    assert_eq!(allowed.messages, vec![Bytes::from_static(b"hi")]);

    let mut metadata = HeaderMap::new();
    metadata.insert("authorization", HeaderValue::from_static("Bearer secret"));
    let reply = invoker
        .unary("/echo.Echo/Say", metadata, Bytes::from_static(b"hi"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"hi"));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CallOrigin::Network,
            CallOrigin::InProcess,
            CallOrigin::Network,
            CallOrigin::InProcess,
        ]
    );
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn network_replies_carry_service_identity() {
    let runtime = started(test_config(), |b| b).await;
    let reply = grpc_unary(&grpc_client(), addr(&runtime), "/echo.Echo/Say", &[], b"x").await;

    assert!(reply.status.is_ok());
    assert_eq!(reply.headers["grpc-service-name"], "echo");
    assert_eq!(reply.headers["grpc-service-version"], "1.0.0");
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn handler_status_and_unknown_methods_reach_the_client() {
    let runtime = started(test_config(), |b| b).await;
    let client = grpc_client();
    let target = addr(&runtime);

    let failed = grpc_unary(&client, target, "/echo.Echo/Fail", &[], b"").await;
    let status = failed.status.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "nothing here");

    let unknown = grpc_unary(&client, target, "/echo.Echo/Nope", &[], b"").await;
    assert_eq!(unknown.status.unwrap_err().code(), Code::Unimplemented);
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn bidirectional_stream_over_network() {
    let runtime = started(test_config(), |b| b).await;
    let reply = grpc_call(
        &grpc_client(),
        addr(&runtime),
        "/echo.Echo/Chat",
        &[],
        &[b"one", b"two", b"three"],
    )
    .await;

    assert!(reply.status.is_ok());
    assert_eq!(
        reply.messages,
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ]
    );
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn health_check_over_network() {
    let runtime = started(test_config(), |b| b).await;
    let request = HealthCheckRequest {
        service: String::new(),
    }
    .encode_to_vec();

    let reply = grpc_unary(
        &grpc_client(),
        addr(&runtime),
        "/grpc.health.v1.Health/Check",
        &[],
        &request,
    )
    .await;
    assert!(reply.status.is_ok());
    let response = HealthCheckResponse::decode(reply.messages[0].clone()).unwrap();
    assert_eq!(response.status, ServingStatus::Serving as i32);
    runtime.close().await.unwrap();
}

fn hello_router() -> Router {
    Router::new().route("/hello", get(|| async { "hello" }))
}

async fn assert_both_protocols(runtime: &Runtime) {
    let target = addr(runtime);

    let response = reqwest::get(format!("http://{target}/hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(response.text().await.unwrap(), "hello");

    let reply = grpc_unary(&grpc_client(), target, "/echo.Echo/Say", &[], b"rpc").await;
    assert!(reply.status.is_ok());
    assert_eq!(reply.messages, vec![Bytes::from_static(b"rpc")]);
}

#[tokio::test]
async fn demux_splits_protocols_on_one_port() {
    let runtime = started(test_config(), |b| b.router(hello_router())).await;
    assert!(runtime.options().demux_enabled());
    assert_both_protocols(&runtime).await;
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn combined_handler_routes_by_content_type() {
    let mut config = test_config();
    config.listener.demux.enabled = false;
    let runtime = started(config, |b| b.router(hello_router())).await;
    assert!(!runtime.options().demux_enabled());
    assert_both_protocols(&runtime).await;
    runtime.close().await.unwrap();
}

async fn say(State(invoker): State<Invoker>, Path(word): Path<String>) -> Result<String, (StatusCode, String)> {
    let reply = invoker
        .unary("/echo.Echo/Say", HeaderMap::new(), Bytes::from(word))
        .await
        .map_err(|status| (StatusCode::BAD_GATEWAY, status.to_string()))?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

#[tokio::test]
async fn gateway_and_introspection_share_the_listener() {
    let mut config = test_config();
    config.gateway.prefix = "/api".into();
    config.features.reflection = true;
    let runtime = started(config, |b| {
        b.gateway(|router, invoker| Ok(router.route("/say/{word}", get(say).with_state(invoker))))
    })
    .await;
    let target = addr(&runtime);

    let response = reqwest::get(format!("http://{target}/api/say/bonjour")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "bonjour");

    let services: serde_json::Value = reqwest::get(format!("http://{target}/_rpc/services"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = services
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert!(names.contains(&"echo.Echo"));
    assert!(names.contains(&"grpc.health.v1.Health"));
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn grpc_web_bridge_over_http1() {
    let mut config = test_config();
    config.web.enabled = true;
    let runtime = started(config, |b| b).await;
    let target = addr(&runtime);

    let response = reqwest::Client::new()
        .post(format!("http://{target}/echo.Echo/Say"))
        .header("content-type", "application/grpc-web+proto")
        .body(frame::encode(b"from the browser").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.bytes().await.unwrap();
    assert_eq!(body.get_u8(), 0);
    let len = body.get_u32() as usize;
    assert_eq!(&body[..len], b"from the browser");
    body.advance(len);

    assert_eq!(body.get_u8(), 0x80);
    let len = body.get_u32() as usize;
    let trailers = std::str::from_utf8(&body[..len]).unwrap();
    assert!(trailers.contains("grpc-status: 0"), "trailers: {trailers}");
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn in_process_calls_work_before_start() {
    let runtime = Runtime::builder(test_config()).build().unwrap();
    runtime.register_service(echo_service(Duration::ZERO)).unwrap();

    let reply = runtime
        .invoker()
        .unary("/echo.Echo/Say", HeaderMap::new(), Bytes::from_static(b"early"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"early"));
}
