//! Integration tests for LevelExecutor
//!
//! These tests run whole plans against mock tools and check scheduling, failure
//! propagation, parameter guarding, the reply guarantee and run-marker cleanup.

use async_trait::async_trait;
use plan_runtime::executor::{
    ExecutorConfig, LevelExecutor, ReplySource, ReplyStatus, StepErrorKind, StepStatus,
    VerificationResult, Verifier,
};
use plan_runtime::settings::{SettingsHandle, ToolSettings};
use plan_runtime::tool::{
    FnTool, ParamKind, Tool, ToolContext, ToolError, ToolRegistry, ToolSchema,
};
use plan_runtime::transport::{ChannelTransport, TerminalEvent, TransportError};
use plan_runtime::{Plan, Step, StepId, StepResult};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Tools
// ============================================================================

#[derive(Debug, Clone)]
struct Invocation {
    step_id: StepId,
    params: Map<String, JsonValue>,
    start: Instant,
    end: Instant,
}

type InvocationLog = Arc<Mutex<Vec<Invocation>>>;

/// Tool that sleeps, records when it ran and returns a fixed output.
struct RecordingTool {
    name: String,
    schema: ToolSchema,
    delay: Duration,
    output: JsonValue,
    log: InvocationLog,
}

impl RecordingTool {
    fn new(name: &str, output: JsonValue, log: &InvocationLog) -> Self {
        Self {
            name: name.to_string(),
            schema: ToolSchema::new(),
            delay: Duration::ZERO,
            output,
            log: Arc::clone(log),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_schema(mut self, schema: ToolSchema) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn invoke(
        &self,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(Invocation {
            step_id: ctx.step_id,
            params,
            start,
            end: Instant::now(),
        });
        Ok(self.output.clone())
    }
}

/// Tool that returns the value of `text` under `summary`.
struct EchoTool {
    log: InvocationLog,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().required("text", ParamKind::Text)
    }

    async fn invoke(
        &self,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let now = Instant::now();
        self.log.lock().unwrap().push(Invocation {
            step_id: ctx.step_id,
            params: params.clone(),
            start: now,
            end: now,
        });
        Ok(json!({ "summary": params["text"].clone() }))
    }
}

fn failing_tool(log: &InvocationLog) -> RecordingTool {
    RecordingTool::new(
        "fail",
        json!({
            "error": true,
            "error_type": "MailboxUnavailable",
            "error_message": "IMAP server refused the connection"
        }),
        log,
    )
}

fn reply_tool(log: &InvocationLog) -> RecordingTool {
    RecordingTool::new(
        "reply_to_user",
        json!({"message": "All done, see attached.", "attachments": ["/tmp/report.pdf"]}),
        log,
    )
}

fn new_log() -> InvocationLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn invoked_steps(log: &InvocationLog) -> Vec<StepId> {
    let mut ids: Vec<StepId> = log.lock().unwrap().iter().map(|i| i.step_id).collect();
    ids.sort_unstable();
    ids
}

fn executor(registry: ToolRegistry) -> (LevelExecutor, UnboundedReceiver<TerminalEvent>) {
    let (transport, rx) = ChannelTransport::new();
    (
        LevelExecutor::new(Arc::new(registry), Arc::new(transport)),
        rx,
    )
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(
            RecordingTool::new("slow", json!({"ok": true}), &log)
                .with_delay(Duration::from_millis(150)),
        )
        .with_tool(RecordingTool::new("merge", json!({"summary": "merged"}), &log));
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("fetch two things and merge them")
        .with_step(Step::new(1, "slow"))
        .with_step(Step::new(2, "slow"))
        .with_step(Step::new(3, "merge").with_dependencies([1, 2]));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.levels, vec![vec![1, 2], vec![3]]);
    assert!(report.results.all_succeeded());

    let entries = log.lock().unwrap().clone();
    let find = |id: StepId| entries.iter().find(|i| i.step_id == id).unwrap().clone();
    let (s1, s2, s3) = (find(1), find(2), find(3));

    // Steps 1 and 2 overlap in time
    assert!(s1.start < s2.end && s2.start < s1.end, "steps 1 and 2 did not overlap");
    // Step 3 starts only after both finished
    assert!(s3.start >= s1.end && s3.start >= s2.end);
}

#[tokio::test]
async fn test_concurrency_limit_serializes_level() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(
        RecordingTool::new("slow", json!({}), &log).with_delay(Duration::from_millis(50)),
    );
    let (executor, _rx) = executor(registry);
    let executor = executor.with_config(ExecutorConfig::new().with_max_parallel_steps(1));

    let plan = Plan::new("sequential")
        .with_step(Step::new(1, "slow"))
        .with_step(Step::new(2, "slow"));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();
    assert_eq!(report.levels, vec![vec![1, 2]]);

    let mut entries = log.lock().unwrap().clone();
    entries.sort_by_key(|i| i.start);
    assert!(entries[1].start >= entries[0].end);
}

#[tokio::test]
async fn test_zero_count_is_exposed_to_later_steps() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("count_unread", json!({"count": 0}), &log))
        .with_tool(EchoTool { log: Arc::clone(&log) });
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("count unread mail")
        .with_step(Step::new(1, "count_unread"))
        .with_step(
            Step::new(2, "echo").with_param("text", json!("You have $step1.count unread emails.")),
        );

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.results.output(1).unwrap()["count"], json!(0));
    assert_eq!(report.results.output(2).unwrap()["summary"], json!("You have 0 unread emails."));
    assert!(report.resolution_warnings.is_empty());
    assert_eq!(report.reply.message, "You have 0 unread emails.");
}

#[tokio::test]
async fn test_nested_path_and_text_coercion() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new(
            "find_file",
            json!({"metadata": {"file_name": "a.pdf", "pages": 3}}),
            &log,
        ))
        .with_tool(EchoTool { log: Arc::clone(&log) });
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("describe file")
        .with_step(Step::new(1, "find_file"))
        .with_step(Step::new(2, "echo").with_param("text", json!("$step1.metadata")))
        .with_step(Step::new(3, "echo").with_param("text", json!("$step1.metadata.file_name")));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.levels, vec![vec![1], vec![2, 3]]);
    let coerced = report.results.output(2).unwrap()["summary"].as_str().unwrap().to_string();
    assert!(coerced.contains("\"file_name\": \"a.pdf\""));
    assert_eq!(report.results.output(3).unwrap()["summary"], json!("a.pdf"));
}

// ============================================================================
// Failure Propagation
// ============================================================================

#[tokio::test]
async fn test_failure_propagates_as_skip() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(failing_tool(&log))
        .with_tool(RecordingTool::new("process", json!({"summary": "processed"}), &log))
        .with_tool(EchoTool { log: Arc::clone(&log) });
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("read mail and summarize")
        .with_step(Step::new(1, "fail"))
        .with_step(Step::new(2, "process").with_dependencies([1]))
        .with_step(Step::new(3, "echo").with_param("text", json!("Summary: $step2.summary")))
        .with_step(Step::new(4, "process"));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    let step1 = report.results.get(1).unwrap();
    assert_eq!(step1.status, StepStatus::Error);
    assert_eq!(
        step1.failure.as_ref().unwrap().kind,
        StepErrorKind::ToolExecution {
            error_type: "MailboxUnavailable".to_string()
        }
    );

    for id in [2, 3] {
        let result = report.results.get(id).unwrap();
        assert_eq!(result.status, StepStatus::Skipped, "step {id} should be skipped");
        assert!(result.failure.as_ref().unwrap().is_dependency_failure());
        assert_eq!(result.attempts, 0);
    }
    assert_eq!(
        report.results.get(2).unwrap().failure.as_ref().unwrap().kind,
        StepErrorKind::DependencyFailure {
            failed_dependencies: vec![1],
            missing_dependencies: vec![],
            unknown_references: vec![],
        }
    );

    // Only the failing step and the independent step were invoked
    assert_eq!(invoked_steps(&log), vec![1, 4]);
    assert_eq!(report.status(), ReplyStatus::CompletedWithErrors);
    assert!(report.reply.message.starts_with("processed"));
}

#[tokio::test]
async fn test_cycle_yields_structural_error_and_no_invocations() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(RecordingTool::new("process", json!({}), &log));
    let (executor, mut rx) = executor(registry);

    let plan = Plan::new("impossible")
        .with_step(Step::new(1, "process").with_param("input", json!("$step3.value")))
        .with_step(Step::new(2, "process").with_dependencies([1]))
        .with_step(Step::new(3, "process").with_dependencies([2]));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    let err = report.structural_error.as_ref().unwrap();
    assert!(err.is_structural());
    assert!(err.to_string().contains("[1, 2, 3]"));
    assert!(log.lock().unwrap().is_empty());
    assert!(report.results.is_empty());

    let event = rx.recv().await.unwrap();
    assert_eq!(event.status, ReplyStatus::Failed);
    assert!(!event.message.trim().is_empty());
}

#[tokio::test]
async fn test_step_timeout() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(
        RecordingTool::new("hang", json!({}), &log).with_delay(Duration::from_secs(5)),
    );
    let (executor, _rx) = executor(registry);
    let executor = executor.with_config(
        ExecutorConfig::new()
            .with_step_timeout(Duration::from_millis(50))
            .with_max_step_attempts(3),
    );

    let started = Instant::now();
    let report = executor
        .run("u1", Plan::new("hang").with_step(Step::new(1, "hang")), CancellationToken::new())
        .await
        .unwrap();

    let result = report.results.get(1).unwrap();
    assert_eq!(result.status, StepStatus::Error);
    assert_eq!(
        result.failure.as_ref().unwrap().kind,
        StepErrorKind::Timeout { timeout_ms: 50 }
    );
    // Timeouts are never retried
    assert_eq!(result.attempts, 1);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.status(), ReplyStatus::Failed);
}

#[tokio::test]
async fn test_out_of_range_reference_fails_only_that_step() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(EchoTool { log: Arc::clone(&log) })
        .with_tool(RecordingTool::new("noop", json!({"summary": "ok"}), &log));
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("bad reference")
        .with_step(Step::new(1, "echo").with_param("text", json!("value: $step99999999999.x")))
        .with_step(Step::new(2, "noop"));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    let step1 = report.results.get(1).unwrap();
    assert_eq!(step1.status, StepStatus::Error);
    assert_eq!(
        step1.failure.as_ref().unwrap().kind,
        StepErrorKind::DependencyFailure {
            failed_dependencies: vec![],
            missing_dependencies: vec![],
            unknown_references: vec!["$step99999999999.x".to_string()],
        }
    );
    assert_eq!(invoked_steps(&log), vec![2]);
    assert_eq!(report.status(), ReplyStatus::CompletedWithErrors);
}

// ============================================================================
// Parameter Guard
// ============================================================================

fn email_schema() -> ToolSchema {
    ToolSchema::new()
        .required("to", ParamKind::String)
        .required("body", ParamKind::Text)
        .optional("attachments", ParamKind::FileRefList)
}

#[tokio::test]
async fn test_guard_rejects_generated_text_as_attachment() {
    let log = new_log();
    let report_text = "Revenue grew in every region this quarter.\n".repeat(14);
    assert!(report_text.chars().count() >= 600);
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("write_report", json!({"content": report_text}), &log))
        .with_tool(
            RecordingTool::new("send_email", json!({"sent": true}), &log)
                .with_schema(email_schema()),
        );
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("email the report")
        .with_step(Step::new(1, "write_report"))
        .with_step(
            Step::new(2, "send_email")
                .with_param("to", json!("boss@example.com"))
                .with_param("body", json!("Report attached"))
                .with_param("attachments", json!(["$step1.content"])),
        );

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    let result = report.results.get(2).unwrap();
    let failure = result.failure.as_ref().unwrap();
    assert!(failure.is_planning());
    match &failure.kind {
        StepErrorKind::Planning { hint } => assert!(hint.contains("file")),
        other => panic!("unexpected failure kind {other:?}"),
    }
    assert_eq!(invoked_steps(&log), vec![1]);
}

#[tokio::test]
async fn test_guard_accepts_short_path_attachment() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("save_file", json!({"path": "out/memo.txt"}), &log))
        .with_tool(
            RecordingTool::new("send_email", json!({"sent": true}), &log)
                .with_schema(email_schema()),
        );
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("email the memo")
        .with_step(Step::new(1, "save_file"))
        .with_step(
            Step::new(2, "send_email")
                .with_param("to", json!("boss@example.com"))
                .with_param("body", json!("Memo attached"))
                .with_param("attachments", json!("$step1.path")),
        );

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert!(report.results.all_succeeded());
    let entries = log.lock().unwrap().clone();
    let sent = entries.iter().find(|i| i.step_id == 2).unwrap();
    assert_eq!(sent.params["attachments"], json!("out/memo.txt"));
    assert_eq!("out/memo.txt".len(), 12);
}

#[tokio::test]
async fn test_missing_input_is_rejected_before_invocation() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("lookup", json!({"name": "Ada"}), &log))
        .with_tool(
            RecordingTool::new("send_email", json!({"sent": true}), &log)
                .with_schema(email_schema()),
        );
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("email someone")
        .with_step(Step::new(1, "lookup"))
        .with_step(
            Step::new(2, "send_email")
                .with_param("to", json!("$step1.email"))
                .with_param("body", json!("Hello $step1.name")),
        );

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    let result = report.results.get(2).unwrap();
    assert!(result.failure.as_ref().unwrap().is_validation());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(report.resolution_warnings.len(), 1);
    assert!(report.resolution_warnings[0].starts_with("step 2:"));
    assert_eq!(invoked_steps(&log), vec![1]);
}

// ============================================================================
// Reply Guarantee
// ============================================================================

#[tokio::test]
async fn test_reply_step_message_is_delivered() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("search", json!({"summary": "found 2"}), &log))
        .with_tool(reply_tool(&log));
    let (executor, mut rx) = executor(registry);

    let plan = Plan::new("find and report")
        .with_step(Step::new(1, "search"))
        .with_step(Step::new(2, "reply_to_user").with_param("message", json!("$step1.summary")));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.reply.source, ReplySource::ReplyStep { step_id: 2 });
    let event = rx.recv().await.unwrap();
    assert_eq!(event.message, "All done, see attached.");
    assert_eq!(event.attachments, vec!["/tmp/report.pdf".to_string()]);
    assert_eq!(event.status, ReplyStatus::Completed);
    assert_eq!(event.run_id, report.run_id);
    assert_eq!(event.requester, "u1");
    // Exactly one terminal event per run
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_reply_step_with_numeric_message() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("count", json!({"count": 4}), &log))
        .with_tool(FnTool::new(
            "reply_to_user",
            ToolSchema::new().required("message", ParamKind::Any),
            |params: Map<String, JsonValue>, _ctx| async move {
                Ok::<_, ToolError>(json!({ "message": params["message"] }))
            },
        ));
    let (executor, _rx) = executor(registry);

    let plan = Plan::new("count things")
        .with_step(Step::new(1, "count"))
        .with_step(Step::new(2, "reply_to_user").with_param("message", json!("$step1.count")));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.results.output(2).unwrap()["message"], json!(4));
    assert_eq!(report.reply.source, ReplySource::ReplyStep { step_id: 2 });
    assert_eq!(report.reply.message, "4");
}

#[tokio::test]
async fn test_reply_guarantee_when_every_step_fails() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(failing_tool(&log));
    let (executor, mut rx) = executor(registry);

    let plan = Plan::new("check my mail")
        .with_step(Step::new(1, "fail"))
        .with_step(Step::new(2, "fail").with_dependencies([1]))
        .with_step(Step::new(3, "no_such_tool"));

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.status(), ReplyStatus::Failed);
    let event = rx.recv().await.unwrap();
    assert!(!event.message.trim().is_empty());
    assert!(!event.message.contains("IMAP server refused"));
    assert!(!event.message.contains("$step"));
}

#[tokio::test]
async fn test_transport_failure_is_reported_not_raised() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(RecordingTool::new("noop", json!({}), &log));
    let (executor, rx) = executor(registry);
    drop(rx);

    let report = executor
        .run("u1", Plan::new("x").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(report.delivery_error, Some(TransportError::Closed)));
    assert!(!executor.run_tracker().is_active("u1"));
}

// ============================================================================
// Cleanup and Cancellation
// ============================================================================

#[tokio::test]
async fn test_run_marker_released_after_success_error_and_rejection() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("noop", json!({}), &log))
        .with_tool(failing_tool(&log));
    let (executor, _rx) = executor(registry);

    let plans = [
        Plan::new("ok").with_step(Step::new(1, "noop")),
        Plan::new("error").with_step(Step::new(1, "fail")),
        Plan::new("cycle").with_step(Step::new(1, "noop").with_dependencies([1])),
    ];

    for plan in plans {
        let report = executor.run("u1", plan, CancellationToken::new()).await;
        assert!(report.is_ok());
        assert!(!executor.run_tracker().is_active("u1"));
    }

    // Immediately re-running for the same requester is not blocked
    assert!(executor
        .run("u1", Plan::new("again").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_run_for_same_requester_is_rejected() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(RecordingTool::new("noop", json!({}), &log));
    let (executor, mut rx) = executor(registry);

    let marker = executor.run_tracker().begin("u1").unwrap();
    let err = executor
        .run("u1", Plan::new("x").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("u1"));
    assert!(log.lock().unwrap().is_empty());
    assert!(rx.try_recv().is_err());

    drop(marker);
    assert!(executor
        .run("u1", Plan::new("x").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("slow", json!({}), &log).with_delay(Duration::from_secs(5)))
        .with_tool(RecordingTool::new("noop", json!({}), &log));
    let (executor, mut rx) = executor(registry);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let plan = Plan::new("long job")
        .with_step(Step::new(1, "slow"))
        .with_step(Step::new(2, "noop").with_dependencies([1]));

    let started = Instant::now();
    let report = executor.run("u1", plan, token).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.results.get(1).unwrap().failure.as_ref().unwrap().is_cancelled());
    let step2 = report.results.get(2).unwrap();
    assert_eq!(step2.status, StepStatus::Skipped);
    assert!(step2.failure.as_ref().unwrap().is_cancelled());
    assert_eq!(report.status(), ReplyStatus::Cancelled);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.status, ReplyStatus::Cancelled);
    assert!(!event.message.is_empty());

    // The cancelled run left no marker behind
    assert!(executor
        .run("u1", Plan::new("next").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_dropped_run_stops_its_tools() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(
        RecordingTool::new("slow", json!({}), &log).with_delay(Duration::from_millis(200)),
    );
    let (executor, _rx) = executor(registry);
    let executor = Arc::new(executor);

    let handle = tokio::spawn({
        let executor = Arc::clone(&executor);
        async move {
            let plan = Plan::new("slow").with_step(Step::new(1, "slow"));
            executor.run("u1", plan, CancellationToken::new()).await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The step task went down with the run and never finished its tool call
    assert!(log.lock().unwrap().is_empty());
    assert!(!executor.run_tracker().is_active("u1"));
}

#[tokio::test]
async fn test_already_cancelled_run_invokes_nothing() {
    let log = new_log();
    let registry = ToolRegistry::new().with_tool(RecordingTool::new("noop", json!({}), &log));
    let (executor, _rx) = executor(registry);
    let token = CancellationToken::new();
    token.cancel();

    let report = executor
        .run("u1", Plan::new("x").with_step(Step::new(1, "noop")), token)
        .await
        .unwrap();

    assert!(log.lock().unwrap().is_empty());
    assert_eq!(report.results.get(1).unwrap().status, StepStatus::Skipped);
    assert_eq!(report.status(), ReplyStatus::Cancelled);
}

// ============================================================================
// Verification and Settings
// ============================================================================

struct NeverFinishes;

#[async_trait]
impl Verifier for NeverFinishes {
    fn name(&self) -> &str {
        "never_finishes"
    }

    fn applies_to(&self, step: &Step) -> bool {
        step.action == "noop"
    }

    async fn verify(
        &self,
        step: &Step,
        _result: &StepResult,
    ) -> anyhow::Result<VerificationResult> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(VerificationResult::passed(step.id, "late"))
    }
}

#[tokio::test]
async fn test_verification_is_attached_and_bounded() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("noop", json!({"summary": "fine"}), &log))
        .with_tool(RecordingTool::new("draft", json!({"summary": "see $step9.body"}), &log));
    let (executor, mut rx) = executor(registry);
    let executor = executor
        .with_config(ExecutorConfig::new().with_verification_timeout(Duration::from_millis(100)))
        .with_verifier(NeverFinishes);

    let plan = Plan::new("verify")
        .with_step(Step::new(1, "noop"))
        .with_step(Step::new(2, "draft"));

    let started = Instant::now();
    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // Verification never changes committed outcomes
    assert!(report.results.all_succeeded());

    let diagnostics = &report.reply.diagnostics;
    assert!(diagnostics.iter().any(|d| d.step_id == 1 && d.is_unverified()));
    assert!(diagnostics.iter().any(|d| d.step_id == 1 && d.passed));
    assert!(diagnostics.iter().any(|d| d.step_id == 2 && !d.passed && !d.is_unverified()));
    assert_eq!(rx.recv().await.unwrap().diagnostics.len(), diagnostics.len());
}

/// Records when each verification began.
struct StartRecorder(Arc<Mutex<Vec<(StepId, Instant)>>>);

#[async_trait]
impl Verifier for StartRecorder {
    fn name(&self) -> &str {
        "start_recorder"
    }

    fn applies_to(&self, _step: &Step) -> bool {
        true
    }

    async fn verify(
        &self,
        step: &Step,
        _result: &StepResult,
    ) -> anyhow::Result<VerificationResult> {
        self.0.lock().unwrap().push((step.id, Instant::now()));
        Ok(VerificationResult::passed(step.id, "recorded"))
    }
}

#[tokio::test]
async fn test_verification_starts_before_level_finishes() {
    let log = new_log();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("quick", json!({"summary": "quick"}), &log))
        .with_tool(
            RecordingTool::new("slow", json!({"summary": "slow"}), &log)
                .with_delay(Duration::from_millis(200)),
        );
    let (executor, _rx) = executor(registry);
    let executor = executor.with_verifier(StartRecorder(Arc::clone(&starts)));

    let plan = Plan::new("verify-early")
        .with_step(Step::new(1, "quick"))
        .with_step(Step::new(2, "slow"));
    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();
    assert!(report.results.all_succeeded());

    let slow_end = log
        .lock()
        .unwrap()
        .iter()
        .find(|i| i.step_id == 2)
        .map(|i| i.end)
        .unwrap();
    let quick_start = starts
        .lock()
        .unwrap()
        .iter()
        .find(|(id, _)| *id == 1)
        .map(|(_, at)| *at)
        .unwrap();
    assert!(quick_start < slow_end);
}

#[tokio::test]
async fn test_verification_can_be_disabled() {
    let log = new_log();
    let registry =
        ToolRegistry::new().with_tool(RecordingTool::new("noop", json!({"summary": "x"}), &log));
    let (executor, _rx) = executor(registry);
    let executor = executor.with_config(ExecutorConfig::new().with_verification(false));

    let report = executor
        .run("u1", Plan::new("x").with_step(Step::new(1, "noop")), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.reply.diagnostics.is_empty());
}

struct SignatureTool;

#[async_trait]
impl Tool for SignatureTool {
    fn name(&self) -> &str {
        "signature"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
    }

    async fn invoke(
        &self,
        _params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let signature: String = ctx
            .settings
            .get("signature")
            .ok_or_else(|| ToolError::ExecutionFailed("signature not configured".to_string()))?;
        Ok(json!({ "summary": signature }))
    }
}

#[tokio::test]
async fn test_settings_snapshot_is_swapped_between_runs() {
    let settings =
        SettingsHandle::new(ToolSettings::new().with_value("signature", json!("Regards, A")));
    let (executor, _rx) = executor(ToolRegistry::new().with_tool(SignatureTool));
    let executor = executor.with_settings(settings.clone());
    let plan = Plan::new("sign").with_step(Step::new(1, "signature"));

    let first = executor.run("u1", plan.clone(), CancellationToken::new()).await.unwrap();
    settings.store(ToolSettings::new().with_value("signature", json!("Cheers, B")));
    let second = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(first.reply.message, "Regards, A");
    assert_eq!(second.reply.message, "Cheers, B");
}

// ============================================================================
// Plan Input
// ============================================================================

#[tokio::test]
async fn test_plan_from_json_document() {
    let log = new_log();
    let registry = ToolRegistry::new()
        .with_tool(RecordingTool::new("get_quote", json!({"price": 225.5, "change": 2.5}), &log))
        .with_tool(EchoTool { log: Arc::clone(&log) });
    let (executor, _rx) = executor(registry);

    let plan = Plan::from_json(
        r#"{
            "goal": "stock update",
            "steps": [
                {"id": 1, "action": "get_quote", "parameters": {"symbol": "AAPL"}},
                {"id": 2, "action": "echo",
                 "parameters": {"text": "Price: $step1.price, Change: $step1.change%"},
                 "reasoning": "tell the user"}
            ]
        }"#,
    )
    .unwrap();

    let report = executor.run("u1", plan, CancellationToken::new()).await.unwrap();

    assert_eq!(report.levels, vec![vec![1], vec![2]]);
    assert_eq!(report.reply.message, "Price: 225.5, Change: 2.5%");
}
