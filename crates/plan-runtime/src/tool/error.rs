//! Error types for the tool module.

use thiserror::Error;

/// Errors a tool invocation can produce.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool ran and failed with a specific error message.
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    /// The call never reached a tool: unknown action or parameters the tool refused.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The tool returned the structured error payload `{error: true, error_type, error_message}`.
    #[error("{error_type}: {message}")]
    Reported { error_type: String, message: String },

    /// Backend communication failed (network, subprocess, ...).
    #[error("Process error: {0}")]
    ProcessError(String),

    /// I/O error occurred during tool execution.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Tool error: {0}")]
    Other(String),
}

impl ToolError {
    /// Check if this error should be retried when the executor allows more than one
    /// attempt per step.
    ///
    /// Only transport-level failures qualify. A tool that reported a failure, rejected
    /// its parameters or failed logically will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::ProcessError(_) | ToolError::IoError(_))
    }

    /// Short classification used in step failure records.
    pub fn error_type(&self) -> &str {
        match self {
            ToolError::ExecutionFailed(_) => "execution_failed",
            ToolError::InvalidParameters(_) => "invalid_parameters",
            ToolError::Reported { error_type, .. } => error_type,
            ToolError::ProcessError(_) => "process_error",
            ToolError::IoError(_) => "io_error",
            ToolError::JsonError(_) => "json_error",
            ToolError::Other(_) => "other",
        }
    }
}
