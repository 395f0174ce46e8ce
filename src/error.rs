//! Error types shared across the runtime.
//!
//! # Taxonomy
//! ```text
//! Fatal at startup  → Error::{Config, Listen, Tls, Hook, Registration, Gateway}
//! Fatal at runtime  → Error::Serve(ServeError) where !is_benign()
//! Benign shutdown   → ServeError::{ListenerClosed, ServerClosed}, suppressed
//! Non-fatal stop    → collected into ShutdownErrors, never abort shutdown
//! ```

use std::fmt;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::lifecycle::RuntimeState;
use crate::net::listener::ListenerError;
use crate::registry::RegistryError;

/// Boxed error returned by caller-supplied hooks and registrars.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level runtime error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listen(#[from] ListenerError),

    #[error("Failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    #[error("{phase} hook #{index} failed: {source}")]
    Hook {
        phase: HookPhase,
        index: usize,
        #[source]
        source: BoxError,
    },

    #[error("Service registration failed after {attempts} attempt(s): {source}")]
    Registration {
        attempts: u32,
        #[source]
        source: RegistryError,
    },

    #[error("Service deregistration failed: {0}")]
    Deregistration(#[source] RegistryError),

    #[error("Gateway registration failed: {0}")]
    Gateway(#[source] BoxError),

    #[error("Service {0} is already registered")]
    DuplicateService(String),

    #[error("Operation not allowed while runtime is {0}")]
    InvalidState(RuntimeState),

    #[error("Serve loop failed: {0}")]
    Serve(#[from] ServeError),

    #[error("{0}")]
    Shutdown(ShutdownErrors),
}

/// Lifecycle hook slot a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPhase::BeforeStart => "before-start",
            HookPhase::AfterStart => "after-start",
            HookPhase::BeforeStop => "before-stop",
            HookPhase::AfterStop => "after-stop",
        };
        f.write_str(name)
    }
}

/// Why a serve loop (demux accept loop, RPC or HTTP serve loop) exited.
///
/// `ListenerClosed` and `ServerClosed` are raised only as a consequence of
/// shutdown and are never surfaced as failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServeError {
    #[error("listener closed")]
    ListenerClosed,

    #[error("server closed")]
    ServerClosed,

    #[error("accept failed: {0}")]
    Accept(#[source] Arc<std::io::Error>),
}

impl ServeError {
    /// Whether this exit is an expected side effect of shutdown.
    pub fn is_benign(&self) -> bool {
        matches!(self, ServeError::ListenerClosed | ServeError::ServerClosed)
    }
}

/// Errors accumulated while stopping. Shared by every `close()` caller.
#[derive(Debug, Clone)]
pub struct ShutdownErrors(Arc<[Arc<Error>]>);

impl ShutdownErrors {
    pub(crate) fn new(errors: Vec<Error>) -> Self {
        Self(errors.into_iter().map(Arc::new).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter().map(|e| e.as_ref())
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shutdown completed with {} error(s): ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
