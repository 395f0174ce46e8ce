//! The unified service runtime.
//!
//! # Data Flow
//! ```text
//! start:
//!     before-start hooks → TLS material → bind → HTTP surface
//!     → demux (split or combined) → serve tasks (TaskGroup)
//!     → announce → Running → after-start hooks → supervisor
//!
//! supervisor (detached):
//!     first of {termination signal, parent token, serve task failure} → stop
//!
//! stop (once, ShutdownLatch):
//!     Stopping → cancel context → before-stop hooks → withdraw
//!     → drain (race: idle / deadline / second signal) → terminate
//!     → Closed → after-stop hooks → release close() waiters
//! ```
//!
//! # Design Decisions
//! - `Runtime` is a cheap handle; clones drive the same instance
//! - Services register only while `Created`; the table and state share one
//!   mutex so nothing slips in during start
//! - The first non-benign serve error is what `run` returns

mod builder;
pub mod identity;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::demux::Demux;
use crate::error::{Error, HookPhase, ShutdownErrors};
use crate::lifecycle::{lock, PhaseController, RuntimeState, ShutdownLatch, Signals, TaskGroup};
use crate::net::tls::{load_tls_config, self_signed};
use crate::net::{BindTarget, CertificateProvider, ConnectionTracker, Listener, LocalAddr, ReloadableTls};
use crate::registry::{Registration, RegistrationManager};
use crate::resilience::RetryPolicy;
use crate::rpc::{health, Dispatcher, Interceptors, Invoker, Pipeline, RpcServer, ServiceDesc, ServiceInfo, ServiceTable};
use crate::server::{self, Handler};

pub use builder::{RuntimeBuilder, RuntimeOptions};

/// Handle to a runtime instance.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    options: RuntimeOptions,
    table: Arc<ServiceTable>,
    phase: PhaseController,
    /// Canceled exactly once, when shutdown begins.
    context: CancellationToken,
    /// Stops the supervisor and signal forwarder once closed.
    background: CancellationToken,
    dispatcher: Dispatcher,
    invoker: Invoker,
    registration: RegistrationManager,
    signals: Signals,
    /// Replaced on every start attempt.
    group: Mutex<Arc<TaskGroup>>,
    connections: ConnectionTracker,
    latch: ShutdownLatch,
    stop_errors: Mutex<Option<ShutdownErrors>>,
    local_addr: Mutex<Option<LocalAddr>>,
    starting: tokio::sync::Mutex<()>,
}

impl Runtime {
    pub fn builder(config: crate::config::RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub(crate) fn from_options(options: RuntimeOptions) -> Result<Self, Error> {
        let config = &options.config;

        let mut collaborators: Vec<Arc<dyn Interceptors>> = Vec::with_capacity(options.interceptors.len() + 1);
        collaborators.push(Arc::new(identity::interceptors(
            &config.service.name,
            &config.service.version,
        )));
        collaborators.extend(options.interceptors.iter().cloned());
        let pipeline = Arc::new(Pipeline::assemble(&collaborators));

        let table = Arc::new(ServiceTable::new());
        let phase = PhaseController::new();
        let context = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::clone(&table), pipeline, phase.watch());
        let invoker = Invoker::new(dispatcher.clone(), context.clone());

        if config.features.health {
            table.register(health::service(Arc::downgrade(&table), phase.watch()))?;
        }

        let registration = RegistrationManager::new(
            Arc::clone(&options.registry),
            RetryPolicy::from(&config.registration),
            config.registration.ttl(),
        );
        let signals = options.signals.clone().unwrap_or_default();

        tracing::debug!(?options, "Runtime built");

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                table,
                phase,
                context,
                background: CancellationToken::new(),
                dispatcher,
                invoker,
                registration,
                signals,
                group: Mutex::new(Arc::new(TaskGroup::new())),
                connections: ConnectionTracker::new(),
                latch: ShutdownLatch::new(),
                stop_errors: Mutex::new(None),
                local_addr: Mutex::new(None),
                starting: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Register a service on both call channels. Only allowed before start.
    pub fn register_service(&self, service: ServiceDesc) -> Result<(), Error> {
        self.inner.table.register(service)
    }

    /// In-process call channel. Usable as soon as the runtime is built.
    pub fn invoker(&self) -> Invoker {
        self.inner.invoker.clone()
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.table.state()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Address the listener bound, once started.
    pub fn local_addr(&self) -> Option<LocalAddr> {
        lock(&self.inner.local_addr).clone()
    }

    /// The announced record, while registered.
    pub fn registration(&self) -> Option<Registration> {
        self.inner.registration.current()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.inner.table.services()
    }

    /// Cancellation token handed to every call; canceled when shutdown begins.
    pub fn context(&self) -> CancellationToken {
        self.inner.context.clone()
    }

    /// Start serving. Returns once every serve task is running and the
    /// instance is announced.
    pub async fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let _starting = inner.starting.lock().await;
        let state = inner.table.state();
        if state != RuntimeState::Created {
            return Err(Error::InvalidState(state));
        }

        inner.options.hooks.run_all(HookPhase::BeforeStart)?;

        let tls = self.certificate_provider().await?;
        let listener = Listener::bind(&inner.options.bind, inner.options.config.listener.max_connections).await?;
        let local = listener.local_addr().clone();

        let router = inner.options.http.build(&inner.table, &inner.invoker)?;
        let rpc = RpcServer::new(inner.dispatcher.clone(), inner.context.clone());
        *lock(&inner.group) = Arc::new(TaskGroup::new());
        // Subscribe before any task runs so an early signal is not missed.
        let terminations = inner.signals.subscribe();
        self.spawn_servers(listener, tls, rpc, router);

        let service = &inner.options.config.service;
        if let Err(e) = inner.registration.announce(&service.name, &service.version, &local).await {
            self.abandon_start().await;
            return Err(e);
        }

        *lock(&inner.local_addr) = Some(local.clone());
        inner.table.transition(RuntimeState::Created, RuntimeState::Running)?;
        tracing::info!(
            service = %service.name,
            version = %service.version,
            address = %local,
            demux = inner.options.demux_enabled(),
            tls = inner.options.has_tls(),
            "Runtime started"
        );

        self.spawn_supervisor(terminations);

        if let Err(e) = inner.options.hooks.run_all(HookPhase::AfterStart) {
            tracing::error!(error = %e, "After-start hook failed, shutting down");
            if let Err(stop_err) = self.stop().await {
                tracing::warn!(error = %stop_err, "Shutdown after failed start reported errors");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Start, then block until closed. Returns the first serve failure, or
    /// the stop-time errors.
    pub async fn run(&self) -> Result<(), Error> {
        self.start().await?;
        self.inner.latch.wait_closed().await;

        if let Some(failure) = self.group().error() {
            return Err(Error::Serve(failure));
        }
        self.close().await
    }

    /// Begin shutdown and carry it out. Returns immediately if the runtime
    /// was never started or another caller already began stopping.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.state() == RuntimeState::Created {
            return Ok(());
        }
        if !self.inner.latch.try_fire() {
            return Ok(());
        }

        match self.shutdown().await {
            Some(errors) => Err(Error::Shutdown(errors)),
            None => Ok(()),
        }
    }

    /// Stop and wait for shutdown to finish, whoever started it.
    pub async fn close(&self) -> Result<(), Error> {
        if self.state() == RuntimeState::Created {
            return Ok(());
        }
        // Errors are reported below, identically for every caller.
        let _ = self.stop().await;
        self.inner.latch.wait_closed().await;

        match lock(&self.inner.stop_errors).clone() {
            Some(errors) => Err(Error::Shutdown(errors)),
            None => Ok(()),
        }
    }

    /// Wait until shutdown completes.
    pub async fn wait_closed(&self) {
        self.inner.latch.wait_closed().await
    }

    async fn certificate_provider(&self) -> Result<Option<Arc<dyn CertificateProvider>>, Error> {
        let options = &self.inner.options;
        if let Some(provider) = &options.tls {
            return Ok(Some(Arc::clone(provider)));
        }

        let listener = &options.config.listener;
        if let Some(files) = &listener.tls {
            let config = load_tls_config(Path::new(&files.cert_path), Path::new(&files.key_path))
                .await
                .map_err(Error::Tls)?;
            tracing::info!(cert_path = %files.cert_path, "TLS certificate loaded");
            return Ok(Some(Arc::new(config)));
        }

        if listener.secure {
            let hosts = certificate_hosts(&options.bind);
            let config = self_signed(hosts).map_err(Error::Tls)?;
            tracing::info!("Generated self-signed certificate");
            return Ok(Some(Arc::new(ReloadableTls::new(config))));
        }

        Ok(None)
    }

    fn spawn_servers(
        &self,
        listener: Listener,
        tls: Option<Arc<dyn CertificateProvider>>,
        rpc: RpcServer,
        router: Option<axum::Router>,
    ) {
        let inner = &self.inner;
        let group = self.group();
        let stop = group.token();
        let phase = inner.phase.watch();
        let read_timeout = inner.options.config.listener.demux.read_timeout();

        if inner.options.demux_enabled() {
            let (demux, rpc_listener, http_listener) = Demux::split(listener, tls, read_timeout);
            group.spawn("demux", demux.run(stop.clone(), phase.clone()));
            group.spawn(
                "rpc",
                server::serve(
                    rpc_listener,
                    Handler::new(Some(rpc), router.clone()),
                    stop.clone(),
                    phase.clone(),
                    inner.connections.clone(),
                ),
            );
            match router {
                Some(router) => group.spawn(
                    "http",
                    server::serve(
                        http_listener,
                        Handler::new(None, Some(router)),
                        stop,
                        phase,
                        inner.connections.clone(),
                    ),
                ),
                None => drop(http_listener),
            }
        } else {
            let (demux, combined) = Demux::combined(listener, tls, read_timeout);
            group.spawn("demux", demux.run(stop.clone(), phase.clone()));
            group.spawn(
                "server",
                server::serve(
                    combined,
                    Handler::new(Some(rpc), router),
                    stop,
                    phase,
                    inner.connections.clone(),
                ),
            );
        }
    }

    fn group(&self) -> Arc<TaskGroup> {
        Arc::clone(&lock(&self.inner.group))
    }

    /// Tear down serve tasks after a failed start. The state stays `Created`.
    async fn abandon_start(&self) {
        let group = self.group();
        group.cancel();
        group.join().await;
        *lock(&self.inner.local_addr) = None;
    }

    fn spawn_supervisor(&self, mut terminations: crate::lifecycle::SignalListener) {
        let inner = &self.inner;

        if inner.options.signals.is_none() && inner.options.config.shutdown.handle_signals {
            if let Err(e) = inner.signals.forward_os_signals(inner.background.clone()) {
                tracing::warn!(error = %e, "OS signal handling unavailable");
            }
        }

        let runtime = self.clone();
        let parent = inner.options.parent.clone();
        let group = self.group();
        tokio::spawn(async move {
            let inner = &runtime.inner;
            let parent_cancelled = async {
                match &parent {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = inner.background.cancelled() => return,
                termination = terminations.recv() => {
                    tracing::info!(signal = %termination, "Termination requested");
                }
                _ = parent_cancelled => {
                    tracing::info!("Parent context canceled");
                }
                Some(failure) = group.failed() => {
                    tracing::error!(error = %failure, "Serve task failed");
                }
            }

            if let Err(e) = runtime.stop().await {
                tracing::warn!(error = %e, "Shutdown reported errors");
            }
        });
    }

    /// The shutdown body. Runs once.
    async fn shutdown(&self) -> Option<ShutdownErrors> {
        let inner = &self.inner;
        let started = Instant::now();

        if let Err(e) = inner.table.transition(RuntimeState::Running, RuntimeState::Stopping) {
            tracing::warn!(error = %e, "Stop requested outside Running");
            inner.latch.complete();
            return None;
        }
        tracing::info!("Runtime stopping");

        let mut forced = inner.signals.subscribe();
        inner.context.cancel();

        let mut errors = inner.options.hooks.run_collect(HookPhase::BeforeStop);
        if let Err(e) = inner.registration.withdraw().await {
            errors.push(e);
        }

        inner.phase.drain();
        let group = self.group();
        let deadline = inner.options.config.shutdown.drain_timeout();
        let drained = async {
            group.join().await;
            inner.connections.wait_idle().await;
            inner.dispatcher.calls().wait_idle().await;
        };

        tokio::select! {
            _ = drained => {
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Drain complete");
            }
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    connections = inner.connections.active_count(),
                    calls = inner.dispatcher.calls().active_count(),
                    "Drain deadline exceeded, terminating"
                );
            }
            termination = forced.recv() => {
                tracing::warn!(signal = %termination, "Second termination, forcing shutdown");
            }
        }

        inner.phase.terminate();
        // The supervisor must see the runtime as closing before the group
        // cancel wakes it.
        inner.background.cancel();
        group.cancel();
        group.abort_all();

        if let Err(e) = inner.table.transition(RuntimeState::Stopping, RuntimeState::Closed) {
            errors.push(e);
        }
        errors.extend(inner.options.hooks.run_collect(HookPhase::AfterStop));

        let result = (!errors.is_empty()).then(|| ShutdownErrors::new(errors));
        *lock(&inner.stop_errors) = result.clone();
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = result.as_ref().map_or(0, |e| e.len()),
            "Runtime closed"
        );
        inner.latch.complete();
        result
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// SANs for a generated certificate.
fn certificate_hosts(bind: &BindTarget) -> Vec<String> {
    let mut hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    if let BindTarget::Tcp(addr) = bind {
        if let Some((host, _)) = addr.rsplit_once(':') {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if !host.is_empty() && host != "0.0.0.0" && host != "::" && !hosts.iter().any(|h| h == host) {
                hosts.push(host.to_string());
            }
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.listener.address = "127.0.0.1:0".into();
        config.shutdown.handle_signals = false;
        config
    }

    #[tokio::test]
    async fn close_before_start_is_a_no_op() {
        let runtime = Runtime::builder(config()).build().unwrap();
        runtime.stop().await.unwrap();
        runtime.close().await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Created);
    }

    #[tokio::test]
    async fn health_is_registered_by_default() {
        let runtime = Runtime::builder(config()).build().unwrap();
        let names: Vec<_> = runtime.services().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![health::SERVICE_NAME.to_string()]);

        let mut without = config();
        without.features.health = false;
        let runtime = Runtime::builder(without).build().unwrap();
        assert!(runtime.services().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_walks_every_state() {
        let runtime = Runtime::builder(config()).build().unwrap();
        runtime.start().await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Running);
        assert!(runtime.local_addr().unwrap().tcp().unwrap().port() != 0);

        assert!(matches!(runtime.start().await, Err(Error::InvalidState(RuntimeState::Running))));
        assert!(matches!(
            runtime.register_service(ServiceDesc::new("late.Service")),
            Err(Error::InvalidState(RuntimeState::Running))
        ));

        runtime.close().await.unwrap();
        assert_eq!(runtime.state(), RuntimeState::Closed);
        assert!(runtime.context().is_cancelled());
        // Options outlive the runtime.
        assert_eq!(runtime.options().bind_target(), &BindTarget::Tcp("127.0.0.1:0".into()));
    }

    #[tokio::test]
    async fn before_start_failure_leaves_created() {
        let runtime = Runtime::builder(config())
            .before_start(|| Err("not ready".into()))
            .build()
            .unwrap();
        let err = runtime.start().await.unwrap_err();
        assert!(matches!(err, Error::Hook { phase: HookPhase::BeforeStart, .. }));
        assert_eq!(runtime.state(), RuntimeState::Created);
        assert!(runtime.local_addr().is_none());
    }

    #[test]
    fn certificate_hosts_include_bind_host() {
        let hosts = certificate_hosts(&BindTarget::Tcp("10.1.2.3:443".into()));
        assert_eq!(hosts, vec!["localhost", "127.0.0.1", "10.1.2.3"]);
        let hosts = certificate_hosts(&BindTarget::Tcp("0.0.0.0:443".into()));
        assert_eq!(hosts, vec!["localhost", "127.0.0.1"]);
    }
}
