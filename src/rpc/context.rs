//! Request-scoped call context.
//!
//! Every interceptor and handler receives the [`CallContext`] explicitly as
//! its first argument. Typed per-call state (authenticated principal, ban
//! decision, request logger fields) lives in its extensions instead of
//! hidden global lookup keys.

use std::sync::{Arc, Mutex};

use http::header::{HeaderName, HeaderValue};
use http::{Extensions, HeaderMap};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::lock;
use crate::net::PeerAddr;

/// Which channel a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOrigin {
    /// Over the runtime's network listener.
    Network,
    /// Through the in-process [`Invoker`](crate::rpc::Invoker).
    InProcess,
}

impl CallOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            CallOrigin::Network => "network",
            CallOrigin::InProcess => "in_process",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    method: Arc<str>,
    origin: CallOrigin,
    metadata: HeaderMap,
    peer: Option<PeerAddr>,
    cancellation: CancellationToken,
    extensions: Extensions,
    response_headers: Arc<Mutex<HeaderMap>>,
}

impl CallContext {
    /// Context for a call to `method` (`/package.Service/Method`).
    pub fn new(method: impl Into<Arc<str>>, origin: CallOrigin) -> Self {
        Self {
            method: method.into(),
            origin,
            metadata: HeaderMap::new(),
            peer: None,
            cancellation: CancellationToken::new(),
            extensions: Extensions::new(),
            response_headers: Arc::new(Mutex::new(HeaderMap::new())),
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_peer(mut self, peer: Option<PeerAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Full method path, e.g. `/echo.Echo/Say`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Service part of the method path.
    pub fn service_name(&self) -> &str {
        split_path(&self.method).map(|(s, _)| s).unwrap_or("")
    }

    /// Method part of the method path.
    pub fn method_name(&self) -> &str {
        split_path(&self.method).map(|(_, m)| m).unwrap_or("")
    }

    pub fn origin(&self) -> CallOrigin {
        self.origin
    }

    /// Incoming request metadata.
    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HeaderMap {
        &mut self.metadata
    }

    pub fn peer(&self) -> Option<&PeerAddr> {
        self.peer.as_ref()
    }

    /// Canceled when the runtime begins shutting down or the call is abandoned.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Attach a header to the call's response. Visible to every clone of
    /// this context.
    pub fn set_response_header(&self, name: HeaderName, value: HeaderValue) {
        lock(&self.response_headers).insert(name, value);
    }

    /// Snapshot of the response headers set so far.
    pub fn response_headers(&self) -> HeaderMap {
        lock(&self.response_headers).clone()
    }
}

/// Split `/package.Service/Method` into its service and method parts.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}
