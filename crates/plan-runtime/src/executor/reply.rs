//! Construction and delivery of the terminal reply.
//!
//! Every run produces exactly one [`FinalReply`] with a non-empty message. The message
//! comes from the first tier that yields usable text:
//!
//! 1. the last successful reply step (an action listed in `reply_actions`),
//! 2. the summary field of the last successful step,
//! 3. a generic status message built from the step counts.
//!
//! Candidates are post-checked: leftover reference syntax is re-resolved or stripped,
//! and blank text or raw JSON dumps fall through to the next tier.

use super::config::ExecutorConfig;
use super::results::{StepResults, StepStatus};
use super::template::{TemplateResolver, contains_reference, stringify, to_text};
use super::verification::VerificationResult;
use crate::plan::{Plan, StepId};
use crate::transport::{TerminalEvent, Transport, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Overall status of a run, as reported to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplyStatus::Completed => "completed",
            ReplyStatus::CompletedWithErrors => "completed_with_errors",
            ReplyStatus::Failed => "failed",
            ReplyStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Where the reply message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum ReplySource {
    ReplyStep { step_id: StepId },
    Summary { step_id: StepId },
    Generic,
}

/// The single terminal reply of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReply {
    /// Never empty.
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    pub status: ReplyStatus,
    pub source: ReplySource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<VerificationResult>,
}

impl FinalReply {
    pub fn with_diagnostics(mut self, diagnostics: Vec<VerificationResult>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// How the run ended, from the executor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// All levels settled.
    Finished,
    /// Cancellation was observed before every level ran.
    Cancelled,
    /// The plan could not be executed at all (cycle, malformed document).
    Rejected { reason: RejectionReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Cycle,
    Malformed,
}

/// Builds the final reply from a plan and its results.
#[derive(Debug, Clone, Copy)]
pub struct ReplyEnforcer<'a> {
    config: &'a ExecutorConfig,
}

impl<'a> ReplyEnforcer<'a> {
    pub fn new(config: &'a ExecutorConfig) -> Self {
        Self { config }
    }

    /// Produces the reply for a run. Infallible; the message is never blank.
    pub fn finalize(&self, plan: &Plan, results: &StepResults, outcome: &RunOutcome) -> FinalReply {
        let status = self.status(plan, results, outcome);

        if let Some((step_id, message, attachments)) = self.from_reply_step(results) {
            tracing::info!(step_id, tier = "reply_step", %status, "Final reply selected");
            return FinalReply {
                message,
                attachments,
                status,
                source: ReplySource::ReplyStep { step_id },
                diagnostics: Vec::new(),
            };
        }

        if let Some((step_id, summary)) = self.from_summary(results) {
            let message = match status {
                ReplyStatus::Completed => summary,
                _ => format!("{}\n\n{}", summary, status_note(plan, results, status)),
            };
            tracing::info!(step_id, tier = "summary", %status, "Final reply selected");
            return FinalReply {
                message,
                attachments: Vec::new(),
                status,
                source: ReplySource::Summary { step_id },
                diagnostics: Vec::new(),
            };
        }

        tracing::info!(tier = "generic", %status, "Final reply selected");
        FinalReply {
            message: generic_message(plan, results, status, outcome),
            attachments: Vec::new(),
            status,
            source: ReplySource::Generic,
            diagnostics: Vec::new(),
        }
    }

    fn status(&self, plan: &Plan, results: &StepResults, outcome: &RunOutcome) -> ReplyStatus {
        match outcome {
            RunOutcome::Rejected { .. } => ReplyStatus::Failed,
            RunOutcome::Cancelled => ReplyStatus::Cancelled,
            RunOutcome::Finished if plan.is_empty() || results.all_succeeded() => {
                ReplyStatus::Completed
            }
            RunOutcome::Finished if results.success_count() == 0 => ReplyStatus::Failed,
            RunOutcome::Finished => ReplyStatus::CompletedWithErrors,
        }
    }

    fn from_reply_step(&self, results: &StepResults) -> Option<(StepId, String, Vec<String>)> {
        results
            .iter()
            .rev()
            .filter(|r| r.is_success() && self.config.is_reply_action(&r.tool_name))
            .find_map(|r| {
                let output = r.output.as_ref()?;
                let text = match output {
                    JsonValue::Object(map) => ["message", "content", "text"]
                        .iter()
                        .find_map(|key| map.get(*key).and_then(scalar_text)),
                    other => scalar_text(other),
                }?;
                let message = post_check(&text, results)?;
                Some((r.step_id, message, attachments_of(output)))
            })
    }

    fn from_summary(&self, results: &StepResults) -> Option<(StepId, String)> {
        results.iter().rev().filter(|r| r.is_success()).find_map(|r| {
            let map = r.output.as_ref()?.as_object()?;
            self.config.summary_fields.iter().find_map(|field| {
                let text = map.get(field)?.as_str()?;
                post_check(text, results).map(|message| (r.step_id, message))
            })
        })
    }

    /// Sends the reply to the requester. This is the only place a run talks to the
    /// transport.
    pub async fn deliver(
        &self,
        transport: &dyn Transport,
        requester: &str,
        run_id: &str,
        reply: &FinalReply,
    ) -> Result<(), TransportError> {
        let event = TerminalEvent {
            requester: requester.to_string(),
            run_id: run_id.to_string(),
            message: reply.message.clone(),
            status: reply.status,
            attachments: reply.attachments.clone(),
            diagnostics: reply.diagnostics.clone(),
        };
        transport.deliver(event).await
    }
}

/// Re-resolves or strips orphaned reference syntax and rejects unusable text.
fn post_check(candidate: &str, results: &StepResults) -> Option<String> {
    let mut text = candidate.to_string();
    if contains_reference(&text) {
        let mut resolver = TemplateResolver::new(results);
        text = to_text(&resolver.resolve(&JsonValue::String(text)));
        for warning in resolver.warnings() {
            tracing::warn!(warning = %warning, "Orphaned reference in reply text");
        }
    }
    let text = text.trim();
    if text.is_empty() || contains_reference(text) || is_structural_dump(text) {
        return None;
    }
    Some(text.to_string())
}

/// Text of a reply field; numbers and booleans count as text.
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(_) | JsonValue::Bool(_) => Some(stringify(value)),
        _ => None,
    }
}

fn is_structural_dump(text: &str) -> bool {
    (text.starts_with('{') || text.starts_with('['))
        && serde_json::from_str::<JsonValue>(text).is_ok_and(|v| v.is_object() || v.is_array())
}

fn attachments_of(output: &JsonValue) -> Vec<String> {
    let items: Vec<&str> = match output.get("attachments") {
        Some(JsonValue::String(s)) => vec![s.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !contains_reference(s))
        .map(str::to_string)
        .collect()
}

fn goal_phrase(plan: &Plan) -> String {
    let goal = plan.goal.trim();
    if goal.is_empty() || contains_reference(goal) {
        "your request".to_string()
    } else {
        format!("\"{}\"", goal)
    }
}

fn step_word(n: usize) -> &'static str {
    if n == 1 { "step" } else { "steps" }
}

fn status_note(plan: &Plan, results: &StepResults, status: ReplyStatus) -> String {
    let total = plan.len();
    let succeeded = results.success_count();
    match status {
        ReplyStatus::Cancelled => format!(
            "The request was cancelled after {} of {} {} completed.",
            succeeded,
            total,
            step_word(total)
        ),
        _ => format!(
            "Note: only {} of {} {} completed successfully.",
            succeeded,
            total,
            step_word(total)
        ),
    }
}

fn generic_message(
    plan: &Plan,
    results: &StepResults,
    status: ReplyStatus,
    outcome: &RunOutcome,
) -> String {
    let goal = goal_phrase(plan);
    let total = plan.len();
    let succeeded = results.success_count();
    let failed = results.count(StepStatus::Error);
    let skipped = results.count(StepStatus::Skipped);

    match (status, outcome) {
        (_, RunOutcome::Rejected { reason: RejectionReason::Cycle }) => format!(
            "I couldn't carry out {} because the planned steps depend on each other in a loop. \
             Please try rephrasing the request.",
            goal
        ),
        (_, RunOutcome::Rejected { reason: RejectionReason::Malformed }) => format!(
            "I couldn't carry out {} because the generated plan was invalid. Please try again.",
            goal
        ),
        (ReplyStatus::Completed, _) if total == 0 => {
            format!("There was nothing to do for {}.", goal)
        }
        (ReplyStatus::Completed, _) => format!(
            "Finished {}: all {} {} completed successfully.",
            goal,
            total,
            step_word(total)
        ),
        (ReplyStatus::Cancelled, _) => format!(
            "The work on {} was cancelled after {} of {} {} completed.",
            goal,
            succeeded,
            total,
            step_word(total)
        ),
        (ReplyStatus::Failed, _) => format!(
            "I wasn't able to complete {}: none of the {} {} succeeded ({} failed, {} skipped).",
            goal,
            total,
            step_word(total),
            failed,
            skipped
        ),
        (ReplyStatus::CompletedWithErrors, _) => format!(
            "I partially completed {}: {} of {} {} succeeded, {} failed and {} {} skipped.",
            goal,
            succeeded,
            total,
            step_word(total),
            failed,
            skipped,
            if skipped == 1 { "was" } else { "were" }
        ),
    }
}
