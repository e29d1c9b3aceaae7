//! Configuration for plan execution.
//!
//! Controls concurrency, timeouts, verification and the heuristics used by the
//! parameter guard and the reply enforcer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for [`super::LevelExecutor`].
///
/// # Examples
///
/// ```ignore
/// use plan_runtime::executor::ExecutorConfig;
/// use std::time::Duration;
///
/// let config = ExecutorConfig::new()
///     .with_max_parallel_steps(4)
///     .with_step_timeout(Duration::from_secs(30))
///     .with_verification(false);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of steps of one level that run at the same time.
    ///
    /// If `None`, every step of a level is dispatched at once.
    pub max_parallel_steps: Option<usize>,

    /// Time bound for a single tool invocation.
    ///
    /// If `None`, no timeout is applied.
    pub step_timeout: Option<Duration>,

    /// Attempts per step, including the first one.
    ///
    /// Extra attempts are spent only on retryable tool errors (process/I/O failures).
    /// Timeouts, guard rejections and dependency failures are never retried.
    ///
    /// **Default:** 1 (a single bounded attempt)
    pub max_step_attempts: usize,

    /// Run background verifiers on completed steps.
    ///
    /// **Default:** `true`
    #[serde(default = "default_true")]
    pub enable_verification: bool,

    /// How long finalization waits for outstanding verification tasks.
    pub verification_timeout: Duration,

    /// Actions whose successful output is the user-facing reply.
    pub reply_actions: Vec<String>,

    /// Output fields treated as a human-readable summary when no reply step ran.
    pub summary_fields: Vec<String>,

    /// Parameter names that always carry file references, whatever the tool schema
    /// declares.
    pub attachment_params: Vec<String>,

    /// A file reference longer than this is treated as inline content.
    pub file_ref_max_chars: usize,

    /// A file reference with more line breaks than this is treated as inline content.
    pub file_ref_max_newlines: usize,
}

/// Helper function for serde default value of `true`.
fn default_true() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorConfig {
    /// Creates a new configuration with default values.
    ///
    /// Default values:
    /// - `max_parallel_steps`: `Some(8)`
    /// - `step_timeout`: 120 seconds
    /// - `max_step_attempts`: `1`
    /// - `enable_verification`: `true`, `verification_timeout`: 10 seconds
    /// - `reply_actions`: `["reply_to_user"]`
    /// - `summary_fields`: `["summary", "message", "content", "text"]`
    /// - `attachment_params`: `["attachments", "attachment", "files", "file_path", "file_paths"]`
    /// - `file_ref_max_chars`: `500`, `file_ref_max_newlines`: `1`
    pub fn new() -> Self {
        Self {
            max_parallel_steps: Some(8),
            step_timeout: Some(Duration::from_secs(120)),
            max_step_attempts: 1,
            enable_verification: true,
            verification_timeout: Duration::from_secs(10),
            reply_actions: vec!["reply_to_user".to_string()],
            summary_fields: ["summary", "message", "content", "text"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            attachment_params: ["attachments", "attachment", "files", "file_path", "file_paths"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            file_ref_max_chars: 500,
            file_ref_max_newlines: 1,
        }
    }

    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = Some(max.max(1));
        self
    }

    /// Removes the concurrency limit.
    pub fn with_unlimited_concurrency(mut self) -> Self {
        self.max_parallel_steps = None;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Removes the step timeout.
    pub fn with_no_timeout(mut self) -> Self {
        self.step_timeout = None;
        self
    }

    pub fn with_max_step_attempts(mut self, attempts: usize) -> Self {
        self.max_step_attempts = attempts.max(1);
        self
    }

    pub fn with_verification(mut self, enable: bool) -> Self {
        self.enable_verification = enable;
        self
    }

    pub fn with_verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn with_reply_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply_actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attachment_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachment_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_reply_action(&self, action: &str) -> bool {
        self.reply_actions.iter().any(|a| a == action)
    }

    pub fn is_attachment_param(&self, name: &str) -> bool {
        self.attachment_params.iter().any(|p| p == name)
    }
}
