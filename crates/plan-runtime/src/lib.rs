//! 'plan-runtime' - the execution core for tool-calling plans.
//!
//! A planner (usually an LLM) turns a user request into a [`Plan`]: an ordered list of
//! [`Step`]s, each naming a tool and its parameters. Parameters may point at the output
//! of earlier steps with references such as `$step1.metadata.file_name`, either as the
//! whole value or embedded in a larger string.
//!
//! This crate takes such a plan and:
//!
//! - derives the dependency graph (explicit `dependencies` plus implicit references)
//!   and partitions it into levels that can run concurrently,
//! - executes level after level with bounded concurrency, per-step timeouts and
//!   cancellation,
//! - resolves references and validates parameters against the tool schema before any
//!   tool is called,
//! - verifies completed results in the background, and
//! - always delivers exactly one non-empty terminal reply, even when every step failed.
//!
//! # Example
//!
//! ```rust,ignore
//! use plan_runtime::executor::{ExecutorConfig, LevelExecutor};
//! use plan_runtime::tool::ToolRegistry;
//! use plan_runtime::transport::ChannelTransport;
//! use plan_runtime::Plan;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let (transport, mut events) = ChannelTransport::new();
//! let executor = LevelExecutor::new(Arc::new(registry), Arc::new(transport))
//!     .with_config(ExecutorConfig::default().with_max_parallel_steps(4));
//!
//! let plan = Plan::from_json(planner_output)?;
//! let report = executor.run("user-42", plan, CancellationToken::new()).await?;
//! println!("{}", report.reply.message);
//! ```

pub mod executor;
pub mod observability;
pub mod plan;
pub mod settings;
pub mod tool;
pub mod transport;

pub use executor::{
    ExecutorConfig, ExecutorError, FinalReply, LevelExecutor, ReplyStatus, RunReport,
    StepResult, StepResults, StepStatus,
};
pub use plan::{Plan, Step, StepId};
pub use settings::{SettingsHandle, ToolSettings};
pub use tool::{Tool, ToolContext, ToolError, ToolRegistry, ToolSchema};
pub use transport::{TerminalEvent, Transport};
