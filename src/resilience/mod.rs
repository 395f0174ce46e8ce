//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Registry announce:
//!     → attempt (registry collaborator)
//!     → On failure: backoff.rs (jittered exponential delay)
//!     → retry until RetryPolicy::max_attempts is exhausted
//! ```
//!
//! # Design Decisions
//! - Jittered backoff prevents thundering herd on registry restarts
//! - No sleep after the final attempt; startup fails immediately

pub mod backoff;

pub use backoff::{calculate_backoff, RetryPolicy};
