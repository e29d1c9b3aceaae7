//! Error types for run-level executor operations.
//!
//! Step-local failures are not errors at this level: they are recorded as
//! [`super::StepFailure`] inside the step's result and never abort a run.

use crate::plan::StepId;
use thiserror::Error;

/// Errors that abort or reject a whole run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The dependency graph cannot be executed (cycle). Raised before any step runs.
    #[error("Structural error: {message}")]
    Structural {
        message: String,
        /// Steps participating in the cycle, in ascending order.
        cycle: Vec<StepId>,
    },

    /// The plan document is malformed (duplicate ids, missing action, ...).
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Another run is still active for the same requester.
    #[error("A run is already active for requester {requester}")]
    RunAlreadyActive { requester: String },

    /// JSON parsing error while reading a plan.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecutorError {
    pub fn cycle(cycle: Vec<StepId>) -> Self {
        let ids = cycle
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Self::Structural {
            message: format!("cyclic dependency between steps [{}]", ids),
            cycle,
        }
    }

    /// Returns true for errors that mean the plan itself cannot run.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExecutorError::Structural { .. }
                | ExecutorError::InvalidPlan(_)
                | ExecutorError::Json(_)
        )
    }
}
