//! Structured task group for serve loops.
//!
//! Every long-running serve task is spawned through a [`TaskGroup`]. The first
//! task to exit with a non-benign [`ServeError`] records it and cancels the
//! group token; siblings select on that token and wind down cooperatively.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::ServeError;
use crate::lifecycle::lock;

#[derive(Debug, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    first_error: Arc<Mutex<Option<ServeError>>>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    aborts: Mutex<Vec<AbortHandle>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token canceled when any task fails.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task into the group.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), ServeError>> + Send + 'static,
    {
        let token = self.token.clone();
        let slot = Arc::clone(&self.first_error);

        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => tracing::debug!(task = name, "Task exited"),
                Err(e) if e.is_benign() => {
                    tracing::debug!(task = name, reason = %e, "Task stopped")
                }
                Err(e) => {
                    tracing::error!(task = name, error = %e, "Task failed");
                    lock(&slot).get_or_insert(e);
                    token.cancel();
                }
            }
        });

        lock(&self.aborts).push(handle.abort_handle());
        lock(&self.handles).push((name, handle));
    }

    /// Resolve once the group is canceled, with the failure that caused it.
    /// `None` when the group was canceled deliberately.
    pub async fn failed(&self) -> Option<ServeError> {
        self.token.cancelled().await;
        lock(&self.first_error).clone()
    }

    /// The recorded failure, if any.
    pub fn error(&self) -> Option<ServeError> {
        lock(&self.first_error).clone()
    }

    /// Ask every task to wind down.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for every spawned task to exit.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *lock(&self.handles));
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = name, "Task panicked");
                }
            }
        }
    }

    /// Abort every task that has not exited yet.
    pub fn abort_all(&self) {
        for handle in lock(&self.aborts).drain(..) {
            handle.abort();
        }
    }
}
