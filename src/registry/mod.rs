//! Service discovery collaborator.
//!
//! # Responsibilities
//! - Define the [`Registry`] contract the runtime announces itself through
//! - Provide the registration record ([`Registration`], [`Node`])
//! - Ship two registries: [`NoopRegistry`] (default) and [`MemoryRegistry`]
//!   (in-process, with watch support)
//!
//! The runtime itself only calls `register` and `deregister`; see
//! [`manager::RegistrationManager`].

pub mod manager;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::BoxError;

pub use manager::RegistrationManager;
pub use memory::{MemoryRegistry, NoopRegistry};

/// One running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// `{service}-{instance uuid}`.
    pub id: String,
    /// Address clients should dial (`host:port` or `unix://path`).
    pub address: String,
}

/// Record announced to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub name: String,
    pub version: String,
    pub node: Node,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("{0} is not registered")]
    NotFound(String),

    #[error("{0} is not supported by this registry")]
    Unsupported(&'static str),

    #[error(transparent)]
    Other(BoxError),
}

/// Change observed through [`Registry::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(Registration),
    Deregistered(Registration),
}

impl RegistryEvent {
    pub fn registration(&self) -> &Registration {
        match self {
            RegistryEvent::Registered(r) | RegistryEvent::Deregistered(r) => r,
        }
    }
}

/// Stream of [`RegistryEvent`]s for one service name (or all, if empty).
#[derive(Debug)]
pub struct Watcher {
    filter: String,
    rx: broadcast::Receiver<RegistryEvent>,
}

impl Watcher {
    pub fn new(filter: impl Into<String>, rx: broadcast::Receiver<RegistryEvent>) -> Self {
        Self {
            filter: filter.into(),
            rx,
        }
    }

    /// Next matching event; `None` once the registry is gone.
    pub async fn next(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.is_empty() || event.registration().name == self.filter => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Registry watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Discovery backend. Implementations must tolerate concurrent calls.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Announce `registration`, valid for `ttl`.
    async fn register(&self, registration: &Registration, ttl: Duration) -> Result<(), RegistryError>;

    /// Withdraw a previously announced record.
    async fn deregister(&self, registration: &Registration) -> Result<(), RegistryError>;

    /// Observe registrations of `service` (empty for every service).
    async fn watch(&self, service: &str) -> Result<Watcher, RegistryError> {
        let _ = service;
        Err(RegistryError::Unsupported("watch"))
    }
}
