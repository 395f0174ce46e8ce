//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start:
//!     before-start hooks → bind listener → demux → spawn serve tasks
//!     → register with discovery → after-start hooks → Running
//!
//! Stop (once, guarded by shutdown.rs latch):
//!     cancel runtime context → before-stop hooks → deregister
//!     → drain (race: idle / deadline / second signal) → Closed → after-stop hooks
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT/SIGQUIT → first triggers shutdown, second forces it
//! ```
//!
//! # Design Decisions
//! - State only moves forward (state.rs)
//! - Serve tasks live in a task group; first real failure cancels the rest
//! - Shutdown has timeout: forced termination after deadline

pub mod hooks;
pub mod shutdown;
pub mod signals;
pub mod state;
pub mod tasks;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use hooks::{Hook, Hooks};
pub use shutdown::{Phase, PhaseController, PhaseWatch, ShutdownLatch};
pub use signals::{SignalListener, Signals, Termination};
pub use state::RuntimeState;
pub use tasks::TaskGroup;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
