//! Shutdown coordination.
//!
//! Two primitives:
//! - [`ShutdownLatch`]: one-shot guard so the shutdown body runs exactly
//!   once, plus the "closed" completion signal waiters block on.
//! - [`PhaseController`]: broadcasts the serving phase to connection tasks
//!   and in-flight calls (Serving → Draining → Terminated).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// One-shot shutdown guard with a completion signal.
#[derive(Debug)]
pub struct ShutdownLatch {
    fired: AtomicBool,
    closed: watch::Sender<bool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            closed,
        }
    }

    /// Returns true for exactly one caller.
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Mark shutdown complete, releasing every waiter.
    pub fn complete(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until [`complete`](Self::complete) has been called.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for ShutdownLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Serving phase observed by connections and calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Accepting connections and calls.
    Serving,
    /// No new connections or calls; in-flight work may finish.
    Draining,
    /// In-flight work is abandoned.
    Terminated,
}

/// Owner side of the phase channel.
#[derive(Debug)]
pub struct PhaseController {
    tx: watch::Sender<Phase>,
}

impl PhaseController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Serving);
        Self { tx }
    }

    pub fn watch(&self) -> PhaseWatch {
        PhaseWatch {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Phase {
        *self.tx.borrow()
    }

    /// Move to `Draining` unless already past it.
    pub fn drain(&self) {
        self.advance(Phase::Draining);
    }

    /// Move to `Terminated`.
    pub fn terminate(&self) {
        self.advance(Phase::Terminated);
    }

    fn advance(&self, next: Phase) {
        self.tx.send_if_modified(|phase| {
            if *phase < next {
                *phase = next;
                true
            } else {
                false
            }
        });
    }
}

impl Default for PhaseController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of the phase channel.
#[derive(Debug, Clone)]
pub struct PhaseWatch {
    rx: watch::Receiver<Phase>,
}

impl PhaseWatch {
    pub fn current(&self) -> Phase {
        *self.rx.borrow()
    }

    pub fn is_serving(&self) -> bool {
        self.current() == Phase::Serving
    }

    /// Resolves once the phase is at or past `phase`.
    pub async fn reached(&self, phase: Phase) {
        let mut rx = self.rx.clone();
        // A dropped controller means the runtime is gone; treat as reached.
        let _ = rx.wait_for(|current| *current >= phase).await;
    }

    pub async fn draining(&self) {
        self.reached(Phase::Draining).await
    }

    pub async fn terminated(&self) {
        self.reached(Phase::Terminated).await
    }
}
