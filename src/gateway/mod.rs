//! HTTP surface assembly.
//!
//! # Data Flow
//! ```text
//! caller Router (or empty)
//!     + gateway registrar(Router, Invoker), nested at gateway.prefix
//!     + web.rs bridge: POST {web.prefix}/{service}/{method} → Invoker
//!     + GET /_rpc/services (introspection)
//!     → middlewares (first registered is outermost)
//!     → CORS, request id, TraceLayer
//! ```
//!
//! # Design Decisions
//! - Gateway and bridge calls go through the in-process [`Invoker`], never
//!   back over the listener
//! - The router is built once at start, after registration has closed
//! - Route conflicts between the pieces surface as [`Error::Gateway`]
//!   rather than axum's panic

pub mod web;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::error::{BoxError, Error};
use crate::rpc::{Invoker, ServiceTable};

/// Path of the introspection endpoint.
pub const SERVICES_PATH: &str = "/_rpc/services";

/// Mounts gateway routes onto the router it is given. Called once at start
/// with the in-process invoker.
pub type GatewayRegistrar = Arc<dyn Fn(Router, Invoker) -> Result<Router, BoxError> + Send + Sync>;

/// Wraps the assembled HTTP router.
pub type Middleware = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Everything that ends up on the HTTP server.
#[derive(Clone, Default)]
pub struct HttpSurface {
    pub router: Option<Router>,
    pub gateway: Option<GatewayRegistrar>,
    pub gateway_prefix: String,
    /// Web bridge prefix; `None` disables the bridge.
    pub web_prefix: Option<String>,
    pub reflection: bool,
    pub middlewares: Vec<Middleware>,
}

impl HttpSurface {
    /// Whether an HTTP server is needed at all.
    pub fn enabled(&self) -> bool {
        self.router.is_some() || self.gateway.is_some() || self.web_prefix.is_some() || self.reflection
    }

    /// Assemble the router, or `None` when nothing is mounted.
    pub fn build(&self, table: &Arc<ServiceTable>, invoker: &Invoker) -> Result<Option<Router>, Error> {
        if !self.enabled() {
            return Ok(None);
        }

        let mut router = self.router.clone().unwrap_or_default();

        if let Some(register) = &self.gateway {
            let mounted = register(Router::new(), invoker.clone()).map_err(Error::Gateway)?;
            router = match normalize(&self.gateway_prefix) {
                Some(prefix) => mount("gateway", || router.nest(&prefix, mounted))?,
                None => mount("gateway", || router.merge(mounted))?,
            };
            tracing::info!(prefix = %self.gateway_prefix, "Gateway mounted");
        }

        if let Some(prefix) = &self.web_prefix {
            let prefix = normalize(prefix).unwrap_or_default();
            let bridge = web::bridge(&prefix, table.paths(), invoker.clone());
            router = mount("web bridge", || router.merge(bridge))?;
        }

        if self.reflection {
            let table = Arc::clone(table);
            router = mount("introspection", || {
                router.route(
                    SERVICES_PATH,
                    get(move || {
                        let services = table.services();
                        async move { Json(services) }
                    }),
                )
            })?;
        }

        for middleware in self.middlewares.iter().rev() {
            router = middleware(router);
        }

        let router = router
            .layer(CorsLayer::permissive())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http());

        Ok(Some(router))
    }
}

impl std::fmt::Debug for HttpSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSurface")
            .field("router", &self.router.is_some())
            .field("gateway", &self.gateway.is_some())
            .field("gateway_prefix", &self.gateway_prefix)
            .field("web_prefix", &self.web_prefix)
            .field("reflection", &self.reflection)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

/// Run one assembly step, reporting an axum route conflict as an error.
fn mount(step: &str, assemble: impl FnOnce() -> Router) -> Result<Router, Error> {
    catch_unwind(AssertUnwindSafe(assemble)).map_err(|payload| {
        let reason = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("route conflict");
        tracing::error!(step, reason, "Failed to assemble HTTP router");
        Error::Gateway(format!("{step}: {reason}").into())
    })
}

/// `"/api/"` → `Some("/api")`, `""` and `"/"` → `None` (root).
fn normalize(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}
