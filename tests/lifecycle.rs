//! Lifecycle integration tests: start, drain, forced termination, hooks,
//! registration.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use common::{addr, echo_service, grpc_client, grpc_unary, test_config};
use rpc_runtime::registry::RegistryError;
use rpc_runtime::{
    Code, Error, HookPhase, MemoryRegistry, Registration, Registry, Runtime, RuntimeState,
    Signals, Termination,
};

fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Result<(), rpc_runtime::BoxError> + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&count);
    (count, move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

async fn wait_for_state(runtime: &Runtime, state: RuntimeState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state reached in time");
}

#[tokio::test]
async fn concurrent_stop_runs_shutdown_once() {
    let (before, before_hook) = counter();
    let (after, after_hook) = counter();
    let runtime = Runtime::builder(test_config())
        .before_stop(before_hook)
        .after_stop(after_hook)
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Running);

    let mut handles = Vec::new();
    for i in 0..4 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                runtime.stop().await
            } else {
                runtime.close().await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    runtime.close().await.unwrap();
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn in_flight_call_completes_during_drain() {
    let runtime = Runtime::builder(test_config()).build().unwrap();
    runtime
        .register_service(echo_service(Duration::from_millis(300)))
        .unwrap();
    runtime.start().await.unwrap();

    let client = grpc_client();
    let target = addr(&runtime);
    let call = tokio::spawn(async move {
        grpc_unary(&client, target, "/echo.Echo/Slow", &[], b"patience").await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    runtime.close().await.unwrap();
    let reply = call.await.unwrap();
    assert!(reply.status.is_ok(), "unexpected status: {:?}", reply.status);
    assert_eq!(reply.messages, vec![Bytes::from_static(b"patience")]);
}

#[tokio::test]
async fn drain_deadline_terminates_slow_calls() {
    let mut config = test_config();
    config.shutdown.drain_timeout_ms = 200;
    let runtime = Runtime::builder(config).build().unwrap();
    runtime
        .register_service(echo_service(Duration::from_secs(30)))
        .unwrap();
    runtime.start().await.unwrap();

    let invoker = runtime.invoker();
    let call = tokio::spawn(async move {
        invoker
            .unary("/echo.Echo/Slow", HeaderMap::new(), Bytes::from_static(b"never"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), runtime.close())
        .await
        .expect("forced shutdown finishes")
        .unwrap();

    let status = call.await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(runtime.state(), RuntimeState::Closed);
}

#[tokio::test]
async fn run_returns_ok_after_requested_termination() {
    let signals = Signals::new();
    let runtime = Runtime::builder(test_config())
        .signals(signals.clone())
        .build()
        .unwrap();

    let running = runtime.clone();
    let run = tokio::spawn(async move { running.run().await });
    wait_for_state(&runtime, RuntimeState::Running).await;

    signals.trigger(Termination::Requested);
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run returns")
        .unwrap();
    assert!(result.is_ok(), "benign shutdown surfaced: {result:?}");
    assert_eq!(runtime.state(), RuntimeState::Closed);
}

#[tokio::test]
async fn second_signal_forces_termination() {
    let signals = Signals::new();
    let mut config = test_config();
    config.shutdown.drain_timeout_ms = 30_000;
    let runtime = Runtime::builder(config)
        .signals(signals.clone())
        .build()
        .unwrap();
    runtime
        .register_service(echo_service(Duration::from_secs(30)))
        .unwrap();
    runtime.start().await.unwrap();

    let invoker = runtime.invoker();
    let call = tokio::spawn(async move {
        invoker
            .unary("/echo.Echo/Slow", HeaderMap::new(), Bytes::from_static(b"stuck"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    signals.trigger(Termination::Terminate);
    wait_for_state(&runtime, RuntimeState::Stopping).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    signals.trigger(Termination::Interrupt);

    tokio::time::timeout(Duration::from_secs(5), runtime.wait_closed())
        .await
        .expect("second signal cuts the drain short");
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert_eq!(call.await.unwrap().unwrap_err().code(), Code::Unavailable);
}

#[tokio::test]
async fn parent_cancellation_stops_runtime() {
    let parent = CancellationToken::new();
    let runtime = Runtime::builder(test_config())
        .parent(parent.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    parent.cancel();
    tokio::time::timeout(Duration::from_secs(5), runtime.wait_closed())
        .await
        .expect("parent cancellation closes the runtime");
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert!(runtime.context().is_cancelled());
}

#[tokio::test]
async fn ephemeral_port_is_announced() {
    let registry = Arc::new(MemoryRegistry::new());
    let runtime = Runtime::builder(test_config())
        .registry(registry.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let port = addr(&runtime).port();
    assert_ne!(port, 0);

    let registration = runtime.registration().expect("announced");
    assert_eq!(registration.name, "echo");
    assert_eq!(registration.version, "1.0.0");
    assert!(registration.node.id.starts_with("echo-"));
    assert!(registration.node.address.ends_with(&format!(":{port}")));
    assert_eq!(registry.lookup("echo"), vec![registration]);

    runtime.close().await.unwrap();
    assert!(registry.lookup("echo").is_empty());
    assert!(runtime.registration().is_none());
}

#[tokio::test]
async fn services_register_only_before_start() {
    let runtime = Runtime::builder(test_config()).build().unwrap();
    runtime.register_service(echo_service(Duration::ZERO)).unwrap();

    let err = runtime
        .register_service(echo_service(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateService(ref name) if name == "echo.Echo"));

    runtime.start().await.unwrap();
    let err = runtime
        .register_service(rpc_runtime::ServiceDesc::new("late.Late"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(RuntimeState::Running)));

    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(RuntimeState::Running)));
    runtime.close().await.unwrap();
}

#[tokio::test]
async fn after_start_failure_stops_runtime() {
    let (after_stop, after_stop_hook) = counter();
    let runtime = Runtime::builder(test_config())
        .after_start(|| Err("warmup failed".into()))
        .after_stop(after_stop_hook)
        .build()
        .unwrap();

    let err = runtime.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Hook {
            phase: HookPhase::AfterStart,
            index: 0,
            ..
        }
    ));
    assert_eq!(runtime.state(), RuntimeState::Closed);
    assert_eq!(after_stop.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_hook_errors_are_collected() {
    let (after_stop, after_stop_hook) = counter();
    let runtime = Runtime::builder(test_config())
        .before_stop(|| Err("flush failed".into()))
        .after_stop(after_stop_hook)
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let errors = match runtime.close().await {
        Err(Error::Shutdown(errors)) => errors,
        other => panic!("expected shutdown errors, got {other:?}"),
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(after_stop.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.state(), RuntimeState::Closed);

    // Later callers observe the same outcome.
    assert!(matches!(runtime.close().await, Err(Error::Shutdown(ref e)) if e.len() == 1));
}

struct DownRegistry {
    attempts: AtomicUsize,
}

#[async_trait]
impl Registry for DownRegistry {
    fn name(&self) -> &str {
        "down"
    }

    async fn register(&self, _registration: &Registration, _ttl: Duration) -> Result<(), RegistryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RegistryError::Unavailable("connection refused".into()))
    }

    async fn deregister(&self, _registration: &Registration) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[tokio::test]
async fn registration_failure_aborts_start() {
    let mut config = test_config();
    config.registration.base_delay_ms = 1;
    config.registration.max_delay_ms = 5;
    let registry = Arc::new(DownRegistry {
        attempts: AtomicUsize::new(0),
    });
    let runtime = Runtime::builder(config)
        .registry(registry.clone())
        .build()
        .unwrap();

    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, Error::Registration { attempts: 3, .. }));
    assert_eq!(registry.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(runtime.state(), RuntimeState::Created);
    assert!(runtime.local_addr().is_none());
}

#[tokio::test]
async fn before_start_failure_never_binds() {
    let runtime = Runtime::builder(test_config())
        .before_start(|| Ok(()))
        .before_start(|| Err("missing secret".into()))
        .build()
        .unwrap();

    let err = runtime.start().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Hook {
            phase: HookPhase::BeforeStart,
            index: 1,
            ..
        }
    ));
    assert!(runtime.local_addr().is_none());
    assert_eq!(runtime.state(), RuntimeState::Created);
}

#[cfg(unix)]
#[tokio::test]
async fn serves_on_unix_socket() {
    let path = std::env::temp_dir().join(format!("rpc-runtime-{}.sock", uuid::Uuid::new_v4()));
    let runtime = Runtime::builder(test_config())
        .address(format!("unix://{}", path.display()))
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    assert_eq!(
        runtime.local_addr(),
        Some(rpc_runtime::net::LocalAddr::Unix(path.clone()))
    );
    assert!(tokio::net::UnixStream::connect(&path).await.is_ok());

    runtime.close().await.unwrap();
    let _ = std::fs::remove_file(&path);
}

/// Counts ERROR-level events.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn clean_close_logs_no_errors() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
    // Current-thread runtime: spawned tasks inherit the thread-local default.
    let _guard = tracing::subscriber::set_default(subscriber);

    for _ in 0..30 {
        let runtime = Runtime::builder(test_config()).build().unwrap();
        runtime.start().await.unwrap();
        runtime.close().await.unwrap();
        // Let the supervisor observe the closed runtime.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(errors.load(Ordering::SeqCst), 0);
}
