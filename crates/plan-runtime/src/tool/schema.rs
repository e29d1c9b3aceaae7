//! Parameter schemas declared by tools and consumed by the parameter guard.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    /// Free text consumed by a human or a text-only tool (reply message, email body).
    /// Structured values resolved into a `Text` parameter are serialized to a string.
    Text,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
    /// A reference to a persisted file (path or file id), never inline content.
    FileRef,
    /// A list of file references. A single reference is also accepted.
    FileRefList,
}

impl ParamKind {
    /// Whether `value` has the shape this kind expects. `null` never matches.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            ParamKind::String | ParamKind::Text | ParamKind::FileRef => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
            ParamKind::Any => !value.is_null(),
            ParamKind::FileRefList => match value {
                JsonValue::String(_) => true,
                JsonValue::Array(items) => items.iter().all(JsonValue::is_string),
                _ => false,
            },
        }
    }

    pub fn is_file_reference(&self) -> bool {
        matches!(self, ParamKind::FileRef | ParamKind::FileRefList)
    }

    pub fn is_text_sink(&self) -> bool {
        matches!(self, ParamKind::Text)
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamKind::String => "string",
            ParamKind::Text => "text",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
            ParamKind::Any => "any",
            ParamKind::FileRef => "file reference",
            ParamKind::FileRefList => "list of file references",
        };
        f.write_str(name)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

/// The parameter schema of a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub params: Vec<ParamSpec>,
    /// Reject parameters the schema does not declare.
    #[serde(default)]
    pub deny_unknown: bool,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn deny_unknown(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ParamKind> {
        self.param(name).map(|p| p.kind)
    }
}
