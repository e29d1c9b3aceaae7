//! Pre-invocation parameter validation.
//!
//! The guard runs on resolved parameters, after the template resolver and before the
//! tool is called. A rejection becomes the step's result; the tool is never invoked.

use super::config::ExecutorConfig;
use super::results::StepFailure;
use crate::tool::ToolSchema;
use serde_json::{Map, Value as JsonValue};

/// Remediation attached to planning errors for inline content in file parameters.
pub const FILE_REFERENCE_HINT: &str = "generate the content first, then persist it to a file \
with a tool that writes files, then pass the resulting file reference here instead of the \
generated text";

/// Validates resolved parameters against a tool schema and known planning mistakes.
#[derive(Debug, Clone, Copy)]
pub struct ParameterGuard<'a> {
    config: &'a ExecutorConfig,
}

impl<'a> ParameterGuard<'a> {
    pub fn new(config: &'a ExecutorConfig) -> Self {
        Self { config }
    }

    /// Validates `params` for `action`.
    ///
    /// `schema` is `None` when the registry has no tool named `action`.
    ///
    /// # Errors
    ///
    /// - [`StepFailure::planning`] when a file-reference parameter carries inline content
    /// - [`StepFailure::validation`] for unknown tools, missing or empty required
    ///   parameters, type mismatches and undeclared parameters on strict schemas
    pub fn validate(
        &self,
        action: &str,
        params: &Map<String, JsonValue>,
        schema: Option<&ToolSchema>,
    ) -> Result<(), StepFailure> {
        let Some(schema) = schema else {
            return Err(StepFailure::validation(format!(
                "unknown tool '{}'",
                action
            )));
        };

        for (name, value) in params {
            let declared = schema.kind_of(name);
            let expects_file = declared.is_some_and(|k| k.is_file_reference())
                || self.config.is_attachment_param(name);
            if expects_file {
                self.check_file_reference(name, value)?;
            }
        }

        for spec in &schema.params {
            match params.get(&spec.name) {
                None | Some(JsonValue::Null) if spec.required => {
                    return Err(StepFailure::validation(format!(
                        "missing required parameter '{}'",
                        spec.name
                    )));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) => {
                    if spec.required && is_blank(value) {
                        return Err(StepFailure::validation(format!(
                            "required parameter '{}' is empty",
                            spec.name
                        )));
                    }
                    if !spec.kind.accepts(value) {
                        return Err(StepFailure::validation(format!(
                            "parameter '{}' expects {}, got {}",
                            spec.name,
                            spec.kind,
                            type_name(value)
                        )));
                    }
                }
            }
        }

        if schema.deny_unknown {
            if let Some(name) = params.keys().find(|name| schema.param(name).is_none()) {
                return Err(StepFailure::validation(format!(
                    "unexpected parameter '{}'",
                    name
                )));
            }
        }

        Ok(())
    }

    fn check_file_reference(&self, name: &str, value: &JsonValue) -> Result<(), StepFailure> {
        let candidates: Vec<&str> = match value {
            JsonValue::String(s) => vec![s.as_str()],
            JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_str).collect(),
            _ => Vec::new(),
        };

        for candidate in candidates {
            if self.looks_like_inline_content(candidate) {
                tracing::warn!(
                    parameter = name,
                    chars = candidate.chars().count(),
                    "Inline content passed where a file reference is expected"
                );
                return Err(StepFailure::planning(
                    format!(
                        "parameter '{}' expects a file reference but received inline \
                         content ({} characters)",
                        name,
                        candidate.chars().count()
                    ),
                    FILE_REFERENCE_HINT,
                ));
            }
        }
        Ok(())
    }

    /// True when `candidate` is too long or has too many line breaks to be a path or id.
    pub fn looks_like_inline_content(&self, candidate: &str) -> bool {
        candidate.chars().count() > self.config.file_ref_max_chars
            || candidate.matches('\n').count() > self.config.file_ref_max_newlines
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(n) if n.is_f64() => "number",
        JsonValue::Number(_) => "integer",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
