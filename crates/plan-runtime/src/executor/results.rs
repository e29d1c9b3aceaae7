//! Step outcome records.
//!
//! Every step of a run ends with exactly one [`StepResult`], stored in the run's
//! [`StepResults`]. Levels execute sequentially, so results of level *k* are complete
//! and immutable before any step of level *k+1* reads them.

use crate::plan::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Parameters failed schema validation.
    Validation,
    /// Parameters show a known planning mistake (inline content where a file
    /// reference belongs). Carries a remediation hint for the planner.
    Planning { hint: String },
    /// The tool raised or reported an error.
    ToolExecution { error_type: String },
    /// The tool did not finish within the step timeout.
    Timeout { timeout_ms: u64 },
    /// A dependency failed, was skipped, or does not exist in the plan.
    DependencyFailure {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_dependencies: Vec<StepId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        missing_dependencies: Vec<StepId>,
        /// References whose step id is out of range, as written.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unknown_references: Vec<String>,
    },
    /// The run was cancelled before or while the step ran.
    Cancelled,
}

/// A serializable step failure: classification plus a message for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    #[serde(flatten)]
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Validation, message)
    }

    pub fn planning(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Planning { hint: hint.into() }, message)
    }

    pub fn tool(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            StepErrorKind::ToolExecution {
                error_type: error_type.into(),
            },
            message,
        )
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::new(
            StepErrorKind::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            format!("tool call exceeded {:?}", timeout),
        )
    }

    pub fn dependency(failed: Vec<StepId>, missing: Vec<StepId>) -> Self {
        let mut parts = Vec::new();
        if !failed.is_empty() {
            parts.push(format!("dependencies did not succeed: {}", join_ids(&failed)));
        }
        if !missing.is_empty() {
            parts.push(format!("dependencies not in plan: {}", join_ids(&missing)));
        }
        Self::new(
            StepErrorKind::DependencyFailure {
                failed_dependencies: failed,
                missing_dependencies: missing,
                unknown_references: Vec::new(),
            },
            parts.join("; "),
        )
    }

    /// Adds references that cannot name any step to a dependency failure.
    pub fn with_unknown_references(mut self, references: Vec<String>) -> Self {
        if references.is_empty() {
            return self;
        }
        if let StepErrorKind::DependencyFailure {
            unknown_references, ..
        } = &mut self.kind
        {
            let note = format!("unknown step references: {}", references.join(", "));
            self.message = if self.message.is_empty() {
                note
            } else {
                format!("{}; {}", self.message, note)
            };
            *unknown_references = references;
        }
        self
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "run was cancelled")
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, StepErrorKind::Timeout { .. })
    }

    pub fn is_dependency_failure(&self) -> bool {
        matches!(self.kind, StepErrorKind::DependencyFailure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, StepErrorKind::Cancelled)
    }

    /// True for guard rejections, including planning errors.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind,
            StepErrorKind::Validation | StepErrorKind::Planning { .. }
        )
    }

    pub fn is_planning(&self) -> bool {
        matches!(self.kind, StepErrorKind::Planning { .. })
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The immutable outcome record for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub tool_name: String,
    pub status: StepStatus,
    /// Tool output. Present only on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    /// Failure detail. Present for `Error` and `Skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    /// Tool invocations spent on this step (0 when the tool was never called).
    pub attempts: usize,
    /// Reference resolution warnings raised while preparing parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepResult {
    pub fn success(
        step_id: StepId,
        tool_name: impl Into<String>,
        output: JsonValue,
        started_at_ms: u64,
    ) -> Self {
        Self {
            step_id,
            tool_name: tool_name.into(),
            status: StepStatus::Success,
            output: Some(output),
            failure: None,
            started_at_ms,
            finished_at_ms: current_timestamp_ms(),
            attempts: 1,
            warnings: Vec::new(),
        }
    }

    pub fn error(
        step_id: StepId,
        tool_name: impl Into<String>,
        failure: StepFailure,
        started_at_ms: u64,
    ) -> Self {
        Self {
            step_id,
            tool_name: tool_name.into(),
            status: StepStatus::Error,
            output: None,
            failure: Some(failure),
            started_at_ms,
            finished_at_ms: current_timestamp_ms(),
            attempts: 0,
            warnings: Vec::new(),
        }
    }

    pub fn skipped(step_id: StepId, tool_name: impl Into<String>, failure: StepFailure) -> Self {
        let now = current_timestamp_ms();
        Self {
            step_id,
            tool_name: tool_name.into(),
            status: StepStatus::Skipped,
            output: None,
            failure: Some(failure),
            started_at_ms: now,
            finished_at_ms: now,
            attempts: 0,
            warnings: Vec::new(),
        }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Append-only map of step results, keyed and iterated by step id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResults {
    results: BTreeMap<StepId, StepResult>,
}

impl StepResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a result. Each id is written once; a second write is ignored and
    /// `false` is returned.
    pub fn record(&mut self, result: StepResult) -> bool {
        if self.results.contains_key(&result.step_id) {
            tracing::warn!(step_id = result.step_id, "Ignoring second result for step");
            return false;
        }
        self.results.insert(result.step_id, result);
        true
    }

    pub fn get(&self, step_id: StepId) -> Option<&StepResult> {
        self.results.get(&step_id)
    }

    /// Output of a step that succeeded.
    pub fn output(&self, step_id: StepId) -> Option<&JsonValue> {
        self.results
            .get(&step_id)
            .filter(|r| r.is_success())
            .and_then(|r| r.output.as_ref())
    }

    pub fn status(&self, step_id: StepId) -> Option<StepStatus> {
        self.results.get(&step_id).map(|r| r.status)
    }

    pub fn contains(&self, step_id: StepId) -> bool {
        self.results.contains_key(&step_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterates results in ascending step id order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &StepResult> {
        self.results.values()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }

    pub fn success_count(&self) -> usize {
        self.count(StepStatus::Success)
    }

    /// Number of steps that errored or were skipped.
    pub fn unsuccessful_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(StepResult::is_success)
    }

    /// Builds results directly from step outputs, all marked successful. Handy for
    /// resolving references outside of a run.
    pub fn from_outputs(outputs: impl IntoIterator<Item = (StepId, JsonValue)>) -> Self {
        let mut results = Self::new();
        for (id, output) in outputs {
            results.record(StepResult::success(id, "external", output, current_timestamp_ms()));
        }
        results
    }
}

/// Returns the current system time in milliseconds since UNIX_EPOCH.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
