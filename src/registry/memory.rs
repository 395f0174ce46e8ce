//! Bundled registries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::lifecycle::lock;
use crate::registry::{Registration, Registry, RegistryError, RegistryEvent, Watcher};

/// Accepts every announcement and remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRegistry;

#[async_trait]
impl Registry for NoopRegistry {
    fn name(&self) -> &str {
        "noop"
    }

    async fn register(&self, _registration: &Registration, _ttl: Duration) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn deregister(&self, _registration: &Registration) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[derive(Debug)]
struct Entry {
    registration: Registration,
    expires_at: Instant,
}

/// In-process registry keyed by node id. Leases expire lazily on read.
#[derive(Debug)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Live registrations of `service`.
    pub fn lookup(&self, service: &str) -> Vec<Registration> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, entry| entry.expires_at > now);
        entries
            .values()
            .filter(|entry| entry.registration.name == service)
            .map(|entry| entry.registration.clone())
            .collect()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register(&self, registration: &Registration, ttl: Duration) -> Result<(), RegistryError> {
        lock(&self.entries).insert(
            registration.node.id.clone(),
            Entry {
                registration: registration.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        let _ = self.events.send(RegistryEvent::Registered(registration.clone()));
        Ok(())
    }

    async fn deregister(&self, registration: &Registration) -> Result<(), RegistryError> {
        let removed = lock(&self.entries).remove(&registration.node.id);
        match removed {
            Some(entry) => {
                let _ = self.events.send(RegistryEvent::Deregistered(entry.registration));
                Ok(())
            }
            None => Err(RegistryError::NotFound(registration.node.id.clone())),
        }
    }

    async fn watch(&self, service: &str) -> Result<Watcher, RegistryError> {
        Ok(Watcher::new(service, self.events.subscribe()))
    }
}
