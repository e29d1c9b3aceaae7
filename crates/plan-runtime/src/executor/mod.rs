//! Plan execution: dependency analysis, level scheduling, reference resolution,
//! parameter guarding, background verification and the terminal reply.
//!
//! The entry point is [`LevelExecutor::run`]. The pieces it is built from are public
//! so hosts can use them on their own, for example to resolve references in a
//! message outside a run or to preview the levels of a plan:
//!
//! ```ignore
//! use plan_runtime::executor::{analyze, level};
//!
//! let graph = analyze(&plan.steps)?;
//! let levels = level(&plan.steps, &graph)?; // e.g. [[1, 2], [3]]
//! ```

pub mod config;
pub mod dependency_analysis;
pub mod dependency_graph;
pub mod error;
pub mod guard;
pub mod level_executor;
pub mod reply;
pub mod results;
pub mod run_tracker;
pub mod template;
pub mod verification;

pub use config::ExecutorConfig;
pub use dependency_analysis::{ExecutionLevels, analyze, implicit_dependencies, level};
pub use dependency_graph::DependencyGraph;
pub use error::ExecutorError;
pub use guard::{FILE_REFERENCE_HINT, ParameterGuard};
pub use level_executor::{LevelExecutor, RunReport};
pub use reply::{FinalReply, RejectionReason, ReplyEnforcer, ReplySource, ReplyStatus, RunOutcome};
pub use results::{StepErrorKind, StepFailure, StepResult, StepResults, StepStatus};
pub use run_tracker::{RunGuard, RunTracker};
pub use template::{TemplateResolver, contains_reference, resolve, strip_references};
pub use verification::{
    ContentQualityVerifier, UNVERIFIED, VerificationResult, VerificationRunner, Verifier,
};
