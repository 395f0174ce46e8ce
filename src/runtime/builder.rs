//! Runtime construction.
//!
//! [`RuntimeBuilder`] combines a validated [`RuntimeConfig`] with the
//! collaborators a file cannot express (registry, interceptors, hooks,
//! routers, certificate provider, signal source, parent token). The result
//! is an immutable [`RuntimeOptions`].

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::{validate_config, ConfigError, RuntimeConfig};
use crate::error::{BoxError, Error, HookPhase};
use crate::gateway::{GatewayRegistrar, HttpSurface, Middleware};
use crate::lifecycle::{Hooks, Signals};
use crate::net::{BindTarget, CertificateProvider, ListenerError};
use crate::registry::{NoopRegistry, Registry};
use crate::rpc::Interceptors;
use crate::runtime::Runtime;

/// Everything a runtime was built from. Never changes after `build`.
pub struct RuntimeOptions {
    pub(crate) config: RuntimeConfig,
    pub(crate) bind: BindTarget,
    pub(crate) tls: Option<Arc<dyn CertificateProvider>>,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptors>>,
    pub(crate) hooks: Hooks,
    pub(crate) http: HttpSurface,
    pub(crate) signals: Option<Signals>,
    pub(crate) parent: Option<CancellationToken>,
}

impl RuntimeOptions {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn bind_target(&self) -> &BindTarget {
        &self.bind
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Caller-supplied interceptor collaborators, in order.
    pub fn interceptors(&self) -> &[Arc<dyn Interceptors>] {
        &self.interceptors
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn http(&self) -> &HttpSurface {
        &self.http
    }

    pub fn demux_enabled(&self) -> bool {
        self.config.listener.demux.enabled
    }

    pub fn has_tls(&self) -> bool {
        self.tls.is_some() || self.config.listener.tls.is_some() || self.config.listener.secure
    }
}

impl std::fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("bind", &self.bind)
            .field("tls", &self.has_tls())
            .field("registry", &self.registry.name())
            .field("interceptors", &self.interceptors.len())
            .field("hooks", &self.hooks)
            .field("http", &self.http)
            .field("demux", &self.demux_enabled())
            .finish_non_exhaustive()
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    tls: Option<Arc<dyn CertificateProvider>>,
    registry: Option<Arc<dyn Registry>>,
    interceptors: Vec<Arc<dyn Interceptors>>,
    hooks: Hooks,
    router: Option<Router>,
    gateway: Option<GatewayRegistrar>,
    middlewares: Vec<Middleware>,
    signals: Option<Signals>,
    parent: Option<CancellationToken>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            tls: None,
            registry: None,
            interceptors: Vec::new(),
            hooks: Hooks::default(),
            router: None,
            gateway: None,
            middlewares: Vec::new(),
            signals: None,
            parent: None,
        }
    }

    /// Override `listener.address`.
    pub fn address(mut self, target: impl Into<String>) -> Self {
        self.config.listener.address = target.into();
        self
    }

    /// Serve TLS with certificates from `provider`, asked once per
    /// connection. Takes precedence over `listener.tls` and `listener.secure`.
    pub fn certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Discovery backend. Defaults to [`NoopRegistry`].
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Append an interceptor collaborator. Chains keep append order.
    pub fn interceptors(mut self, collaborator: Arc<dyn Interceptors>) -> Self {
        self.interceptors.push(collaborator);
        self
    }

    pub fn hook<F>(mut self, phase: HookPhase, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.push(phase, Arc::new(hook));
        self
    }

    pub fn before_start<F>(self, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hook(HookPhase::BeforeStart, hook)
    }

    pub fn after_start<F>(self, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hook(HookPhase::AfterStart, hook)
    }

    pub fn before_stop<F>(self, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hook(HookPhase::BeforeStop, hook)
    }

    pub fn after_stop<F>(self, hook: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hook(HookPhase::AfterStop, hook)
    }

    /// Caller routes served on the HTTP side. A path that collides with the
    /// gateway, the web bridge or `/_rpc/services` fails start with
    /// [`Error::Gateway`].
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Gateway mounted at `gateway.prefix`, called with the in-process
    /// invoker at start.
    pub fn gateway<F>(mut self, register: F) -> Self
    where
        F: Fn(Router, crate::rpc::Invoker) -> Result<Router, BoxError> + Send + Sync + 'static,
    {
        self.gateway = Some(Arc::new(register));
        self
    }

    /// Wrap the HTTP router. The first middleware added is the outermost.
    pub fn middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Termination source. Injecting one disables OS signal handling.
    pub fn signals(mut self, signals: Signals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Stop the runtime when `token` is canceled.
    pub fn parent(mut self, token: CancellationToken) -> Self {
        self.parent = Some(token);
        self
    }

    pub fn build(self) -> Result<Runtime, Error> {
        validate_config(&self.config).map_err(|errors| Error::Config(ConfigError::Validation(errors)))?;
        let bind: BindTarget = self
            .config
            .listener
            .address
            .parse()
            .map_err(|e| Error::Listen(ListenerError::Target(e)))?;

        let http = HttpSurface {
            router: self.router,
            gateway: self.gateway,
            gateway_prefix: self.config.gateway.prefix.clone(),
            web_prefix: self
                .config
                .web
                .enabled
                .then(|| self.config.web.prefix.clone()),
            reflection: self.config.features.reflection,
            middlewares: self.middlewares,
        };

        let options = RuntimeOptions {
            bind,
            tls: self.tls,
            registry: self.registry.unwrap_or_else(|| Arc::new(NoopRegistry)),
            interceptors: self.interceptors,
            hooks: self.hooks,
            http,
            signals: self.signals,
            parent: self.parent,
            config: self.config,
        };

        Runtime::from_options(options)
    }
}
