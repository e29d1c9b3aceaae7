use super::{Tool, ToolContext, ToolError, ToolSchema};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Central registry of tool instances, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let tool: Arc<dyn Tool> = Arc::new(tool);
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<ToolSchema> {
        self.tools.get(name).map(|tool| tool.schema())
    }

    /// Return sorted list of registered tool names.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invokes a tool by name and normalises in-band error payloads into `Err`.
    pub async fn invoke(
        &self,
        action: &str,
        params: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let Some(tool) = self.tools.get(action) else {
            return Err(ToolError::InvalidParameters(format!(
                "unknown tool: {action}"
            )));
        };

        let output = tool.invoke(params, ctx).await?;
        match reported_error(&output) {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

/// Recognises `{"error": true, "error_type": "...", "error_message": "..."}`.
fn reported_error(output: &JsonValue) -> Option<ToolError> {
    let obj = output.as_object()?;
    if obj.get("error").and_then(JsonValue::as_bool) != Some(true) {
        return None;
    }
    let error_type = obj
        .get("error_type")
        .and_then(JsonValue::as_str)
        .unwrap_or("ToolError")
        .to_string();
    let message = obj
        .get("error_message")
        .and_then(JsonValue::as_str)
        .unwrap_or("the tool reported an unspecified error")
        .to_string();
    Some(ToolError::Reported {
        error_type,
        message,
    })
}
