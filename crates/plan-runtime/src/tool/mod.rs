//! Tool registry contract.
//!
//! The execution core treats every tool (mail, calendar, document search, ...) as a
//! black box: a named capability with a declared parameter schema that takes a JSON
//! object and returns a structured JSON value. Tools are registered in a
//! [`ToolRegistry`] and looked up by the step's `action` name.
//!
//! # Implementing a tool
//!
//! ```rust,ignore
//! use plan_runtime::tool::{ParamKind, Tool, ToolContext, ToolError, ToolSchema};
//! use serde_json::{Map, Value, json};
//!
//! struct CountFiles;
//!
//! #[async_trait::async_trait]
//! impl Tool for CountFiles {
//!     fn name(&self) -> &str {
//!         "count_files"
//!     }
//!
//!     fn description(&self) -> &str {
//!         "Counts files in a folder"
//!     }
//!
//!     fn schema(&self) -> ToolSchema {
//!         ToolSchema::new().required("folder", ParamKind::String)
//!     }
//!
//!     async fn invoke(
//!         &self,
//!         params: Map<String, Value>,
//!         _ctx: &ToolContext,
//!     ) -> Result<Value, ToolError> {
//!         let folder = params["folder"].as_str().unwrap_or_default();
//!         let count = std::fs::read_dir(folder)?.count();
//!         Ok(json!({ "count": count, "summary": format!("{count} files in {folder}") }))
//!     }
//! }
//! ```
//!
//! Tools that prefer to signal failure in-band may return
//! `{"error": true, "error_type": "...", "error_message": "..."}`; the registry turns
//! that payload into [`ToolError::Reported`].

pub mod error;
pub mod registry;
pub mod schema;

pub use error::ToolError;
pub use registry::ToolRegistry;
pub use schema::{ParamKind, ParamSpec, ToolSchema};

use crate::plan::StepId;
use crate::settings::ToolSettings;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Who the run is for (user id, chat session, ...).
    pub requester: String,
    pub step_id: StepId,
    /// Configuration snapshot captured when the run started.
    pub settings: Arc<ToolSettings>,
    /// Fires when the run is cancelled. Long-running tools may observe it to stop early.
    pub cancellation: CancellationToken,
}

impl ToolContext {
    pub fn new(requester: impl Into<String>, step_id: StepId, settings: Arc<ToolSettings>) -> Self {
        Self {
            requester: requester.into(),
            step_id,
            settings,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// A capability record: name, parameter schema, and the invocation itself.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the planner uses in a step's `action`.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Declared parameters, validated before every invocation.
    fn schema(&self) -> ToolSchema;

    /// Executes the tool with already-resolved and validated parameters.
    async fn invoke(
        &self,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError>;
}

type ToolFn = Box<
    dyn Fn(Map<String, JsonValue>, ToolContext) -> BoxFuture<'static, Result<JsonValue, ToolError>>
        + Send
        + Sync,
>;

/// Adapter that turns an async closure plus a schema into a [`Tool`].
pub struct FnTool {
    name: String,
    description: String,
    schema: ToolSchema,
    f: ToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, schema: ToolSchema, f: F) -> Self
    where
        F: Fn(Map<String, JsonValue>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            schema,
            f: Box::new(move |params, ctx| Box::pin(f(params, ctx))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn invoke(
        &self,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        (self.f)(params, ctx.clone()).await
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}
