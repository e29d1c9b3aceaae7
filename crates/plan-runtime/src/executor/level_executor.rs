//! Level-by-level plan execution.
//!
//! Levels run strictly one after another. All steps of a level are dispatched as
//! separate tasks (bounded by a semaphore) and the level settles only when every task
//! has been joined; the next level then reads a complete, immutable set of results.

use super::config::ExecutorConfig;
use super::dependency_analysis::{ExecutionLevels, analyze, level};
use super::dependency_graph::DependencyGraph;
use super::error::ExecutorError;
use super::guard::ParameterGuard;
use super::reply::{FinalReply, RejectionReason, ReplyEnforcer, ReplyStatus, RunOutcome};
use super::results::{StepFailure, StepResult, StepResults, StepStatus, current_timestamp_ms};
use super::run_tracker::RunTracker;
use super::template::TemplateResolver;
use super::verification::{ContentQualityVerifier, VerificationRunner, Verifier};
use crate::plan::{Plan, Step, StepId};
use crate::settings::{SettingsHandle, ToolSettings};
use crate::tool::{ToolContext, ToolError, ToolRegistry};
use crate::transport::{Transport, TransportError};
use futures::FutureExt;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Delay before retry number `n` is `n * RETRY_BASE_DELAY`.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_run_id() -> String {
    format!(
        "run-{}-{}",
        current_timestamp_ms(),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Everything a caller may want to know about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    /// The execution levels that were computed (empty if the plan was rejected).
    pub levels: ExecutionLevels,
    pub results: StepResults,
    /// The reply that was handed to the transport.
    pub reply: FinalReply,
    /// Resolution warnings of all steps, prefixed with the step id.
    pub resolution_warnings: Vec<String>,
    /// Set when the plan was rejected before any step ran.
    pub structural_error: Option<ExecutorError>,
    /// Set when the transport failed to deliver the reply.
    pub delivery_error: Option<TransportError>,
}

impl RunReport {
    pub fn status(&self) -> ReplyStatus {
        self.reply.status
    }
}

/// Executes plans level by level and delivers the final reply.
///
/// # Examples
///
/// ```ignore
/// use plan_runtime::executor::{ExecutorConfig, LevelExecutor};
/// use std::time::Duration;
///
/// let executor = LevelExecutor::new(registry, transport).with_config(
///     ExecutorConfig::new()
///         .with_max_parallel_steps(4)
///         .with_step_timeout(Duration::from_secs(30)),
/// );
/// let report = executor.run("user-1", plan, CancellationToken::new()).await?;
/// ```
pub struct LevelExecutor {
    registry: Arc<ToolRegistry>,
    transport: Arc<dyn Transport>,
    config: Arc<ExecutorConfig>,
    settings: SettingsHandle,
    verifiers: Vec<Arc<dyn Verifier>>,
    tracker: RunTracker,
}

impl LevelExecutor {
    /// Creates an executor with default configuration, empty tool settings and the
    /// built-in content quality verifier.
    pub fn new(registry: Arc<ToolRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            config: Arc::new(ExecutorConfig::default()),
            settings: SettingsHandle::default(),
            verifiers: vec![Arc::new(ContentQualityVerifier::new())],
            tracker: RunTracker::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Uses a shared settings handle; each run reads one snapshot of it.
    pub fn with_settings(mut self, settings: SettingsHandle) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_verifier(mut self, verifier: impl Verifier + 'static) -> Self {
        self.verifiers.push(Arc::new(verifier));
        self
    }

    /// Replaces all verifiers, including the built-in one.
    pub fn with_verifiers(mut self, verifiers: Vec<Arc<dyn Verifier>>) -> Self {
        self.verifiers = verifiers;
        self
    }

    /// Shares run markers with other executors serving the same requesters.
    pub fn with_run_tracker(mut self, tracker: RunTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn run_tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Runs `plan` for `requester` and delivers exactly one terminal reply.
    ///
    /// Step failures, structural rejections and cancellation all end in an `Ok`
    /// report carrying a non-empty reply. The run marker for `requester` is held for
    /// the duration of the call and released on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::RunAlreadyActive`] if another run for `requester` is
    /// still in progress. Nothing is executed or delivered in that case.
    pub async fn run(
        &self,
        requester: &str,
        plan: Plan,
        cancellation_token: CancellationToken,
    ) -> Result<RunReport, ExecutorError> {
        let guard = self.tracker.begin(requester)?;
        let run_id = next_run_id();
        let span = info_span!(
            "plan_run",
            run_id = %run_id,
            requester = %guard.requester(),
            total_steps = plan.len(),
        );

        let report = self
            .run_inner(requester, run_id, plan, cancellation_token)
            .instrument(span)
            .await;
        Ok(report)
    }

    async fn run_inner(
        &self,
        requester: &str,
        run_id: String,
        plan: Plan,
        cancellation_token: CancellationToken,
    ) -> RunReport {
        info!("Starting plan execution for goal: {}", plan.goal);

        let settings = self.settings.snapshot();
        let verifiers = if self.config.enable_verification {
            self.verifiers.clone()
        } else {
            Vec::new()
        };
        let mut verification = VerificationRunner::new(verifiers);
        let mut results = Arc::new(StepResults::new());

        let prepared = plan
            .validate_shape()
            .and_then(|_| analyze(&plan.steps))
            .and_then(|graph| level(&plan.steps, &graph).map(|levels| (graph, levels)));

        let (levels, outcome, structural_error) = match prepared {
            Ok((graph, levels)) => {
                info!(levels = levels.len(), "Plan analyzed");
                let outcome = self
                    .execute_levels(
                        &plan,
                        &graph,
                        &levels,
                        &mut results,
                        &mut verification,
                        &settings,
                        requester,
                        &cancellation_token,
                    )
                    .await;
                (levels, outcome, None)
            }
            Err(e) => {
                error!(error = %e, "Plan rejected before execution");
                let reason = match e {
                    ExecutorError::Structural { .. } => RejectionReason::Cycle,
                    _ => RejectionReason::Malformed,
                };
                (Vec::new(), RunOutcome::Rejected { reason }, Some(e))
            }
        };

        let diagnostics = verification
            .collect(self.config.verification_timeout)
            .await;
        let results = Arc::unwrap_or_clone(results);

        let enforcer = ReplyEnforcer::new(&self.config);
        let reply = enforcer
            .finalize(&plan, &results, &outcome)
            .with_diagnostics(diagnostics);

        let delivery_error = match enforcer
            .deliver(self.transport.as_ref(), requester, &run_id, &reply)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "Failed to deliver final reply");
                Some(e)
            }
        };

        let resolution_warnings = results
            .iter()
            .flat_map(|r| {
                r.warnings
                    .iter()
                    .map(move |w| format!("step {}: {}", r.step_id, w))
            })
            .collect();

        info!(
            status = %reply.status,
            succeeded = results.success_count(),
            unsuccessful = results.unsuccessful_count(),
            "Plan execution finished"
        );

        RunReport {
            run_id,
            levels,
            results,
            reply,
            resolution_warnings,
            structural_error,
            delivery_error,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_levels(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        levels: &ExecutionLevels,
        results: &mut Arc<StepResults>,
        verification: &mut VerificationRunner,
        settings: &Arc<ToolSettings>,
        requester: &str,
        cancellation_token: &CancellationToken,
    ) -> RunOutcome {
        for (level_index, step_ids) in levels.iter().enumerate() {
            if cancellation_token.is_cancelled() {
                warn!(level = level_index, "Run cancelled; remaining levels will not start");
                let remaining = levels[level_index..].iter().flatten();
                let store = Arc::make_mut(results);
                for step_id in remaining {
                    if let Some(step) = plan.step(*step_id) {
                        let failure = StepFailure::cancelled();
                        store.record(StepResult::skipped(step.id, &step.action, failure));
                    }
                }
                return RunOutcome::Cancelled;
            }

            let level_span = info_span!(
                "level",
                level = level_index,
                steps = step_ids.len()
            );
            self.execute_level(
                plan,
                graph,
                step_ids,
                results,
                verification,
                settings,
                requester,
                cancellation_token,
            )
            .instrument(level_span)
            .await;
        }

        let cancelled = results
            .iter()
            .any(|r| r.failure.as_ref().is_some_and(StepFailure::is_cancelled));
        if cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Finished
        }
    }

    /// Runs one level: synchronous dependency checks, concurrent dispatch, then a
    /// barrier that joins every task before results are stored.
    ///
    /// Step tasks live in a `JoinSet`, so dropping the run future aborts them.
    #[allow(clippy::too_many_arguments)]
    async fn execute_level(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        step_ids: &[StepId],
        results: &mut Arc<StepResults>,
        verification: &mut VerificationRunner,
        settings: &Arc<ToolSettings>,
        requester: &str,
        cancellation_token: &CancellationToken,
    ) {
        info!("Executing level with {} steps", step_ids.len());

        let semaphore = self
            .config
            .max_parallel_steps
            .map(|n| Arc::new(Semaphore::new(n)));
        let mut settled = Vec::new();
        let mut tasks = JoinSet::new();
        let mut in_flight: BTreeMap<StepId, String> = BTreeMap::new();

        for step_id in step_ids {
            let Some(step) = plan.step(*step_id) else {
                continue;
            };

            if let Some(result) = Self::check_dependencies(step, graph, results) {
                log_settled(&result);
                settled.push(result);
                continue;
            }

            if cancellation_token.is_cancelled() {
                let result =
                    StepResult::skipped(step.id, &step.action, StepFailure::cancelled());
                log_settled(&result);
                settled.push(result);
                continue;
            }

            let job = StepJob {
                step: step.clone(),
                registry: Arc::clone(&self.registry),
                config: Arc::clone(&self.config),
                results: Arc::clone(results),
                settings: Arc::clone(settings),
                requester: requester.to_string(),
                cancellation_token: cancellation_token.clone(),
                semaphore: semaphore.clone(),
            };
            let step_span = info_span!(
                "plan_step",
                step_id = step.id,
                action = %step.action,
            );
            debug!(step_id = step.id, "Dispatching step");
            in_flight.insert(step.id, step.action.clone());
            tasks.spawn(job.run_catching_panics().instrument(step_span));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    in_flight.remove(&result.step_id);
                    log_settled(&result);
                    if result.is_success()
                        && let Some(step) = plan.step(result.step_id)
                    {
                        verification.spawn(step, &result);
                    }
                    settled.push(result);
                }
                Err(e) => error!(error = %e, "Step task did not complete"),
            }
        }

        // Tasks that never reported back were torn down by the runtime.
        for (step_id, action) in in_flight {
            let failure = StepFailure::cancelled();
            let result = StepResult::error(step_id, action, failure, current_timestamp_ms());
            log_settled(&result);
            settled.push(result);
        }

        // Every task has been joined, so this is the only live reference.
        let store = Arc::make_mut(results);
        for result in settled {
            store.record(result);
        }
    }

    /// Returns the settled result for a step that must not run because a dependency
    /// is missing from the plan or did not succeed.
    fn check_dependencies(
        step: &Step,
        graph: &DependencyGraph,
        results: &StepResults,
    ) -> Option<StepResult> {
        let missing: Vec<StepId> = graph.missing_dependencies(step.id).into_iter().collect();
        let unknown = graph.unknown_references(step.id);
        let failed: Vec<StepId> = graph
            .get_dependencies(step.id)
            .into_iter()
            .filter(|dep| results.status(*dep) != Some(StepStatus::Success))
            .collect();

        if !missing.is_empty() || !unknown.is_empty() {
            let failure = StepFailure::dependency(failed, missing).with_unknown_references(unknown);
            let started_at = current_timestamp_ms();
            return Some(StepResult::error(step.id, &step.action, failure, started_at));
        }
        if !failed.is_empty() {
            let failure = StepFailure::dependency(failed, Vec::new());
            return Some(StepResult::skipped(step.id, &step.action, failure));
        }
        None
    }
}

impl std::fmt::Debug for LevelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field(
                "verifiers",
                &self.verifiers.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn log_settled(result: &StepResult) {
    match (&result.status, &result.failure) {
        (StepStatus::Success, _) => info!(
            step_id = result.step_id,
            attempts = result.attempts,
            "Step completed successfully"
        ),
        (StepStatus::Skipped, Some(failure)) => info!(
            step_id = result.step_id,
            error_kind = ?failure.kind,
            "Step skipped: {}",
            failure
        ),
        (_, Some(failure)) => warn!(
            step_id = result.step_id,
            error_kind = ?failure.kind,
            "Step failed: {}",
            failure
        ),
        (_, None) => warn!(step_id = result.step_id, "Step failed"),
    }
}

/// Why a single tool invocation did not produce output.
enum InvokeError {
    Tool(ToolError),
    Timeout(Duration),
    Cancelled,
}

impl InvokeError {
    fn into_failure(self) -> StepFailure {
        match self {
            InvokeError::Tool(e) => StepFailure::tool(e.error_type(), e.to_string()),
            InvokeError::Timeout(d) => StepFailure::timeout(d),
            InvokeError::Cancelled => StepFailure::cancelled(),
        }
    }
}

/// Everything a spawned step task owns.
struct StepJob {
    step: Step,
    registry: Arc<ToolRegistry>,
    config: Arc<ExecutorConfig>,
    results: Arc<StepResults>,
    settings: Arc<ToolSettings>,
    requester: String,
    cancellation_token: CancellationToken,
    semaphore: Option<Arc<Semaphore>>,
}

impl StepJob {
    /// Runs the step, turning a panicking tool into a `ToolExecution` failure.
    async fn run_catching_panics(self) -> StepResult {
        let step_id = self.step.id;
        let action = self.step.action.clone();
        let started_at = current_timestamp_ms();

        match AssertUnwindSafe(self.run()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(step_id, "Tool panicked during execution");
                let failure = StepFailure::tool("Panic", "tool panicked during execution");
                StepResult::error(step_id, action, failure, started_at)
            }
        }
    }

    async fn run(self) -> StepResult {
        let step = &self.step;

        let _permit = match &self.semaphore {
            Some(semaphore) => tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    return StepResult::skipped(step.id, &step.action, StepFailure::cancelled());
                }
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            },
            None => None,
        };
        let started_at = current_timestamp_ms();

        let schema = self.registry.schema(&step.action);
        let mut resolver = TemplateResolver::new(&self.results);
        let params = resolver.resolve_parameters(&step.parameters, schema.as_ref());
        let warnings = resolver.into_warnings();

        if let Err(failure) =
            ParameterGuard::new(&self.config).validate(&step.action, &params, schema.as_ref())
        {
            warn!(error = %failure, "Parameters rejected");
            return StepResult::error(step.id, &step.action, failure, started_at)
                .with_warnings(warnings);
        }

        let ctx = ToolContext::new(self.requester.clone(), step.id, Arc::clone(&self.settings))
            .with_cancellation(self.cancellation_token.child_token());
        let max_attempts = self.config.max_step_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.invoke_once(params.clone(), &ctx).await {
                Ok(output) => {
                    return StepResult::success(step.id, &step.action, output, started_at)
                        .with_attempts(attempts)
                        .with_warnings(warnings);
                }
                Err(InvokeError::Tool(e)) if e.is_retryable() && attempts < max_attempts => {
                    let delay = RETRY_BASE_DELAY * attempts as u32;
                    warn!(
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Tool call failed; retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => {
                            let failure = StepFailure::cancelled();
                            return StepResult::error(step.id, &step.action, failure, started_at)
                                .with_attempts(attempts)
                                .with_warnings(warnings);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return StepResult::error(step.id, &step.action, e.into_failure(), started_at)
                        .with_attempts(attempts)
                        .with_warnings(warnings);
                }
            }
        }
    }

    /// One bounded tool call, raced against cancellation.
    async fn invoke_once(
        &self,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, InvokeError> {
        let call = self.registry.invoke(&self.step.action, params, ctx);

        match self.config.step_timeout {
            Some(timeout_duration) => tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    warn!("Step cancelled");
                    Err(InvokeError::Cancelled)
                }
                timeout_result = tokio::time::timeout(timeout_duration, call) => {
                    match timeout_result {
                        Ok(result) => result.map_err(InvokeError::Tool),
                        Err(_) => {
                            warn!(timeout = ?timeout_duration, "Step execution timed out");
                            Err(InvokeError::Timeout(timeout_duration))
                        }
                    }
                }
            },
            None => tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    warn!("Step cancelled");
                    Err(InvokeError::Cancelled)
                }
                result = call => result.map_err(InvokeError::Tool),
            },
        }
    }
}
