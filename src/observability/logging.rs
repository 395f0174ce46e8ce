//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber once per process
//! - Honour `RUST_LOG` over the configured level
//!
//! The library never calls this on its own; binaries and tests opt in.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber with `level` as the default filter.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},tower_http=info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}
