//! Service table shared by both call channels.
//!
//! The registered services and the runtime state live under one mutex, so a
//! registration is either visible to every channel or to none, and no
//! registration can slip in once the runtime has left `Created`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::lifecycle::{lock, RuntimeState};
use crate::rpc::context::split_path;
use crate::rpc::descriptor::{ServiceDesc, ServiceInfo, StreamDesc, UnaryHandler};

/// Resolved target of a method path.
#[derive(Clone)]
pub enum Route {
    Unary(UnaryHandler),
    Stream(StreamDesc),
}

#[derive(Debug)]
struct Inner {
    state: RuntimeState,
    services: BTreeMap<String, Arc<ServiceDesc>>,
}

#[derive(Debug)]
pub struct ServiceTable {
    inner: Mutex<Inner>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RuntimeState::Created,
                services: BTreeMap::new(),
            }),
        }
    }

    /// Register a service. Fails on a duplicate name or once started.
    pub fn register(&self, desc: ServiceDesc) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        if inner.state != RuntimeState::Created {
            return Err(Error::InvalidState(inner.state));
        }
        if inner.services.contains_key(desc.name()) {
            return Err(Error::DuplicateService(desc.name().to_string()));
        }

        tracing::debug!(service = desc.name(), "Service registered");
        inner.services.insert(desc.name().to_string(), Arc::new(desc));
        Ok(())
    }

    /// Resolve `/package.Service/Method`.
    pub fn route(&self, path: &str) -> Option<Route> {
        let (service, method) = split_path(path)?;
        let inner = lock(&self.inner);
        let desc = inner.services.get(service)?;

        if let Some(m) = desc.method(method) {
            return Some(Route::Unary(Arc::clone(&m.handler)));
        }
        desc.stream_desc(method).cloned().map(Route::Stream)
    }

    pub fn contains(&self, service: &str) -> bool {
        lock(&self.inner).services.contains_key(service)
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        lock(&self.inner).services.values().map(|d| d.info()).collect()
    }

    /// Every registered method and stream path.
    pub fn paths(&self) -> Vec<String> {
        lock(&self.inner)
            .services
            .values()
            .flat_map(|d| d.paths().collect::<Vec<_>>())
            .collect()
    }

    pub fn state(&self) -> RuntimeState {
        lock(&self.inner).state
    }

    /// Move `from → to`. Fails if the current state is not `from` or the
    /// step is not a legal transition.
    pub fn transition(&self, from: RuntimeState, to: RuntimeState) -> Result<(), Error> {
        let mut inner = lock(&self.inner);
        if inner.state != from || !from.can_transition_to(to) {
            return Err(Error::InvalidState(inner.state));
        }
        inner.state = to;
        drop(inner);

        tracing::debug!(from = %from, to = %to, "Runtime state changed");
        crate::observability::metrics::set_state(to);
        Ok(())
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}
