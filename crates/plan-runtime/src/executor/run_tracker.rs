//! Per-requester "run is active" markers.
//!
//! A marker is owned by a [`RunGuard`] and removed when the guard drops, so it is
//! released on success, error, cancellation and panic unwinding alike.

use super::error::ExecutorError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Tracks which requesters have a run in progress.
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a run as active for `requester`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::RunAlreadyActive`] if a marker is already held.
    pub fn begin(&self, requester: &str) -> Result<RunGuard, ExecutorError> {
        if !self.lock().insert(requester.to_string()) {
            return Err(ExecutorError::RunAlreadyActive {
                requester: requester.to_string(),
            });
        }
        debug!(requester, "Run marker acquired");
        Ok(RunGuard {
            tracker: self.clone(),
            requester: requester.to_string(),
        })
    }

    pub fn is_active(&self, requester: &str) -> bool {
        self.lock().contains(requester)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    // A panic while holding the lock cannot leave the set half-updated.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds a requester's run marker; dropping it releases the marker.
#[derive(Debug)]
pub struct RunGuard {
    tracker: RunTracker,
    requester: String,
}

impl RunGuard {
    pub fn requester(&self) -> &str {
        &self.requester
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.tracker.lock().remove(&self.requester) {
            debug!(requester = %self.requester, "Run marker released");
        }
    }
}
