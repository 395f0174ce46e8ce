//! Runtime state machine.
//!
//! ```text
//! Created → Running → Stopping → Closed
//! ```
//! No transition skips a state and none goes backwards.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Created,
    Running,
    Stopping,
    Closed,
}

impl RuntimeState {
    /// Whether `self → next` is one of the three legal transitions.
    pub fn can_transition_to(self, next: RuntimeState) -> bool {
        matches!(
            (self, next),
            (RuntimeState::Created, RuntimeState::Running)
                | (RuntimeState::Running, RuntimeState::Stopping)
                | (RuntimeState::Stopping, RuntimeState::Closed)
        )
    }

    /// Value reported on the `rpc_runtime_state` gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            RuntimeState::Created => 0.0,
            RuntimeState::Running => 1.0,
            RuntimeState::Stopping => 2.0,
            RuntimeState::Closed => 3.0,
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Created => "created",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Closed => "closed",
        };
        f.write_str(name)
    }
}
