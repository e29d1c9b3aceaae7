//! Plan input types.
//!
//! A [`Plan`] is produced by the planning collaborator and is read-only to the
//! execution core. It arrives as JSON:
//!
//! ```json
//! {
//!   "goal": "Email the Q3 report to Alice",
//!   "steps": [
//!     {"id": 1, "action": "search_documents", "parameters": {"query": "Q3 report"}},
//!     {"id": 2, "action": "compose_email",
//!      "parameters": {"to": "alice@example.com", "attachments": ["$step1.doc_path"]},
//!      "dependencies": [1]}
//!   ]
//! }
//! ```

use crate::executor::ExecutorError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;

/// Identifier of a step inside a plan. Unique, 1-based and stable.
pub type StepId = u32;

/// One declared tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Tool name, looked up in the tool registry.
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    /// Explicit dependencies. Implicit ones are discovered from `$stepN` references.
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Step {
    pub fn new(id: StepId, action: impl Into<String>) -> Self {
        Self {
            id,
            action: action.into(),
            parameters: Map::new(),
            dependencies: Vec::new(),
            reasoning: None,
        }
    }

    /// Adds a parameter. Builder style, mostly used by tests and hand-written plans.
    pub fn with_param(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = StepId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// The full step graph for one user run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Parses a plan document and checks its shape.
    pub fn from_json(json: &str) -> Result<Self, ExecutorError> {
        let plan: Plan = serde_json::from_str(json)?;
        plan.validate_shape()?;
        Ok(plan)
    }

    /// Checks the structural properties the executor relies on: ids are non-zero and
    /// unique, and every step names an action.
    pub fn validate_shape(&self) -> Result<(), ExecutorError> {
        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.id == 0 {
                return Err(ExecutorError::InvalidPlan(
                    "step ids are 1-based; found id 0".to_string(),
                ));
            }
            if !seen.insert(step.id) {
                return Err(ExecutorError::InvalidPlan(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
            if step.action.trim().is_empty() {
                return Err(ExecutorError::InvalidPlan(format!(
                    "step {} has no action",
                    step.id
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
