//! Lifecycle hooks.
//!
//! Hooks are zero-argument functions run strictly in registration order.
//! Start-side hooks abort on the first failure; stop-side hooks all run and
//! their failures are collected.

use std::fmt;
use std::sync::Arc;

use crate::error::{BoxError, Error, HookPhase};

/// A lifecycle hook.
pub type Hook = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    before_start: Vec<Hook>,
    after_start: Vec<Hook>,
    before_stop: Vec<Hook>,
    after_stop: Vec<Hook>,
}

impl Hooks {
    pub fn push(&mut self, phase: HookPhase, hook: Hook) {
        self.slot_mut(phase).push(hook);
    }

    pub fn get(&self, phase: HookPhase) -> &[Hook] {
        match phase {
            HookPhase::BeforeStart => &self.before_start,
            HookPhase::AfterStart => &self.after_start,
            HookPhase::BeforeStop => &self.before_stop,
            HookPhase::AfterStop => &self.after_stop,
        }
    }

    fn slot_mut(&mut self, phase: HookPhase) -> &mut Vec<Hook> {
        match phase {
            HookPhase::BeforeStart => &mut self.before_start,
            HookPhase::AfterStart => &mut self.after_start,
            HookPhase::BeforeStop => &mut self.before_stop,
            HookPhase::AfterStop => &mut self.after_stop,
        }
    }

    /// Run every hook of `phase`, stopping at the first failure.
    pub fn run_all(&self, phase: HookPhase) -> Result<(), Error> {
        for (index, hook) in self.get(phase).iter().enumerate() {
            hook().map_err(|source| Error::Hook {
                phase,
                index,
                source,
            })?;
        }
        Ok(())
    }

    /// Run every hook of `phase`, collecting failures.
    pub fn run_collect(&self, phase: HookPhase) -> Vec<Error> {
        self.get(phase)
            .iter()
            .enumerate()
            .filter_map(|(index, hook)| {
                hook().err().map(|source| {
                    tracing::warn!(%phase, index, error = %source, "Lifecycle hook failed");
                    Error::Hook {
                        phase,
                        index,
                        source,
                    }
                })
            })
            .collect()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_start", &self.before_start.len())
            .field("after_start", &self.after_start.len())
            .field("before_stop", &self.before_stop.len())
            .field("after_stop", &self.after_stop.len())
            .finish()
    }
}
