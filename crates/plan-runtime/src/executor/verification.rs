//! Background verification of completed steps.
//!
//! Verifiers run as supervised tasks next to the level loop. They never gate step
//! progression and never change a committed [`StepResult`]; their results are joined
//! once, at finalization, with a bounded wait.

use super::results::StepResult;
use super::template::contains_reference;
use crate::plan::{Step, StepId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Detail recorded for verification tasks that errored or did not finish in time.
pub const UNVERIFIED: &str = "unverified";

/// Outcome of one verifier on one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub step_id: StepId,
    pub passed: bool,
    pub detail: String,
}

impl VerificationResult {
    pub fn passed(step_id: StepId, detail: impl Into<String>) -> Self {
        Self {
            step_id,
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn failed(step_id: StepId, detail: impl Into<String>) -> Self {
        Self {
            step_id,
            passed: false,
            detail: detail.into(),
        }
    }

    pub fn unverified(step_id: StepId) -> Self {
        Self::failed(step_id, UNVERIFIED)
    }

    pub fn is_unverified(&self) -> bool {
        !self.passed && self.detail == UNVERIFIED
    }
}

/// A background check on a successful step.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this verifier should run for `step`.
    fn applies_to(&self, step: &Step) -> bool;

    async fn verify(&self, step: &Step, result: &StepResult) -> anyhow::Result<VerificationResult>;
}

/// Spawns verifiers and joins them at finalization.
pub struct VerificationRunner {
    verifiers: Vec<Arc<dyn Verifier>>,
    tasks: JoinSet<(usize, anyhow::Result<VerificationResult>)>,
    /// task key -> step id, for tasks that have not reported yet
    outstanding: BTreeMap<usize, StepId>,
    next_key: usize,
}

impl VerificationRunner {
    pub fn new(verifiers: Vec<Arc<dyn Verifier>>) -> Self {
        Self {
            verifiers,
            tasks: JoinSet::new(),
            outstanding: BTreeMap::new(),
            next_key: 0,
        }
    }

    /// Number of spawned tasks that have not been collected.
    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    /// Spawns every applicable verifier for a stored step result. Returns immediately.
    pub fn spawn(&mut self, step: &Step, result: &StepResult) {
        for verifier in &self.verifiers {
            if !verifier.applies_to(step) {
                continue;
            }
            let key = self.next_key;
            self.next_key += 1;
            self.outstanding.insert(key, step.id);

            let verifier = Arc::clone(verifier);
            let step = step.clone();
            let result = result.clone();
            tracing::debug!(step_id = step.id, verifier = verifier.name(), "Spawning verification");
            self.tasks.spawn(async move {
                let outcome = verifier.verify(&step, &result).await;
                (key, outcome)
            });
        }
    }

    /// Waits up to `timeout` for all spawned tasks, then aborts the rest.
    ///
    /// Errors, panics and tasks still running at the deadline all degrade to
    /// `passed = false, detail = "unverified"`. Results are ordered by step id.
    pub async fn collect(self, timeout: Duration) -> Vec<VerificationResult> {
        let Self {
            mut tasks,
            mut outstanding,
            ..
        } = self;
        let mut results = Vec::new();

        let joined_all = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((key, outcome)) => {
                        let Some(step_id) = outstanding.remove(&key) else {
                            continue;
                        };
                        match outcome {
                            Ok(result) => results.push(result),
                            Err(e) => {
                                tracing::warn!(step_id, error = %e, "Verification failed to run");
                                results.push(VerificationResult::unverified(step_id));
                            }
                        }
                    }
                    // The key is lost with a panic; the entry stays outstanding.
                    Err(e) => tracing::warn!(error = %e, "Verification task panicked"),
                }
            }
        })
        .await
        .is_ok();

        if !joined_all {
            tracing::warn!(
                remaining = outstanding.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Verification timed out; aborting remaining tasks"
            );
            tasks.abort_all();
        }

        results.extend(outstanding.into_values().map(VerificationResult::unverified));
        results.sort_by_key(|r| r.step_id);
        results
    }
}

impl std::fmt::Debug for VerificationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationRunner")
            .field(
                "verifiers",
                &self.verifiers.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field("pending", &self.outstanding.len())
            .finish()
    }
}

/// Checks that a step's textual output is usable: text fields are non-empty and carry
/// no leftover `$stepN` reference syntax.
#[derive(Debug, Clone, Default)]
pub struct ContentQualityVerifier {
    /// Restrict to these actions. Empty means every action.
    actions: Vec<String>,
}

impl ContentQualityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    fn check(step_id: StepId, output: &JsonValue) -> VerificationResult {
        let texts: Vec<(&str, &str)> = match output {
            JsonValue::String(s) => vec![("output", s.as_str())],
            JsonValue::Object(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s)))
                .collect(),
            _ => Vec::new(),
        };

        if texts.is_empty() {
            return VerificationResult::passed(step_id, "no text content");
        }
        if let Some((field, _)) = texts.iter().find(|(_, text)| text.trim().is_empty()) {
            return VerificationResult::failed(step_id, format!("field '{}' is empty", field));
        }
        if let Some((field, _)) = texts.iter().find(|(_, text)| contains_reference(text)) {
            return VerificationResult::failed(
                step_id,
                format!("field '{}' contains unresolved reference syntax", field),
            );
        }
        VerificationResult::passed(step_id, "content ok")
    }
}

#[async_trait]
impl Verifier for ContentQualityVerifier {
    fn name(&self) -> &str {
        "content_quality"
    }

    fn applies_to(&self, step: &Step) -> bool {
        self.actions.is_empty() || self.actions.iter().any(|a| *a == step.action)
    }

    async fn verify(&self, step: &Step, result: &StepResult) -> anyhow::Result<VerificationResult> {
        let output = result
            .output
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("step {} has no output", step.id))?;
        Ok(Self::check(step.id, output))
    }
}
