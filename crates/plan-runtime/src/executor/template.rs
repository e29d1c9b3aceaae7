//! Resolution of `$stepN` references against earlier step outputs.
//!
//! A reference names a step and a path into its output:
//!
//! - `$step1.count`
//! - `$step2.metadata.file_name`
//! - `$step3.items[0].title` (indices with brackets or dots: `$step3.items.0.title`)
//! - `{$step1.price}` (braces delimit a reference inside running text)
//!
//! A string that consists of exactly one reference resolves to the referenced value
//! with its original JSON type. References embedded in a larger string are rendered
//! to text and substituted left to right. Missing steps or paths resolve to `null`
//! (whole value) or the empty string (embedded) and record a warning; no reference
//! syntax survives resolution.

use super::results::StepResults;
use crate::plan::StepId;
use crate::tool::ToolSchema;
use regex::{Captures, Regex};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\{\$step(\d+)((?:\.[A-Za-z0-9_]+|\[\d+\])*)\}|\$step(\d+)((?:\.[A-Za-z0-9_]+|\[\d+\])*)",
    )
    .expect("reference pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed `$stepN.path` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub step_id: StepId,
    path: Vec<PathSegment>,
    raw: String,
}

impl Reference {
    fn from_captures(caps: &Captures<'_>) -> Option<Self> {
        let (id, path) = match (caps.get(1), caps.get(3)) {
            (Some(id), _) => (id, caps.get(2)),
            (None, Some(id)) => (id, caps.get(4)),
            (None, None) => return None,
        };
        let step_id = id.as_str().parse::<StepId>().ok()?;
        let raw = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
        Some(Self {
            step_id,
            path: parse_path(path.map(|m| m.as_str()).unwrap_or("")),
            raw,
        })
    }

    /// Dotted form of the path, e.g. `metadata.file_name` or `items[0]`.
    pub fn path(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                PathSegment::Index(i) => out.push_str(&format!("[{}]", i)),
            }
        }
        out
    }

    /// The reference exactly as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let end = tail.find(['.', '[']).unwrap_or(tail.len());
            segments.push(PathSegment::Key(tail[..end].to_string()));
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']').unwrap_or(tail.len());
            if let Ok(index) = tail[..end].parse::<usize>() {
                segments.push(PathSegment::Index(index));
            }
            rest = tail.get(end + 1..).unwrap_or("");
        } else {
            break;
        }
    }
    segments
}

fn lookup<'a>(value: &'a JsonValue, path: &[PathSegment]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |current, segment| match (segment, current) {
        (PathSegment::Key(key), JsonValue::Object(map)) => map.get(key),
        (PathSegment::Key(key), JsonValue::Array(items)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (PathSegment::Index(i), JsonValue::Array(items)) => items.get(*i),
        _ => None,
    })
}

/// Returns true if `text` contains reference syntax.
pub fn contains_reference(text: &str) -> bool {
    REFERENCE.is_match(text)
}

/// Parses every reference in `text`, left to right.
pub fn references_in_str(text: &str) -> Vec<Reference> {
    REFERENCE
        .captures_iter(text)
        .filter_map(|caps| Reference::from_captures(&caps))
        .collect()
}

/// Collects the step ids referenced anywhere inside `value`.
pub fn referenced_steps(value: &JsonValue) -> BTreeSet<StepId> {
    let mut ids = BTreeSet::new();
    collect_referenced_steps(value, &mut ids);
    ids
}

fn collect_referenced_steps(value: &JsonValue, ids: &mut BTreeSet<StepId>) {
    match value {
        JsonValue::String(s) => ids.extend(references_in_str(s).into_iter().map(|r| r.step_id)),
        JsonValue::Array(items) => items.iter().for_each(|v| collect_referenced_steps(v, ids)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_referenced_steps(v, ids)),
        _ => {}
    }
}

/// Returns references inside `value` whose step id is too large to name any step,
/// exactly as written.
pub fn unparsable_references(value: &JsonValue) -> Vec<String> {
    let mut found = Vec::new();
    collect_unparsable(value, &mut found);
    found
}

fn collect_unparsable(value: &JsonValue, found: &mut Vec<String>) {
    match value {
        JsonValue::String(s) => found.extend(
            REFERENCE
                .captures_iter(s)
                .filter(|caps| Reference::from_captures(caps).is_none())
                .filter_map(|caps| caps.get(0).map(|m| m.as_str().to_string())),
        ),
        JsonValue::Array(items) => items.iter().for_each(|v| collect_unparsable(v, found)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_unparsable(v, found)),
        _ => {}
    }
}

fn is_whole_reference(trimmed: &str) -> bool {
    REFERENCE
        .find(trimmed)
        .is_some_and(|m| m.start() == 0 && m.end() == trimmed.len())
}

/// Removes any reference syntax from `text`.
pub fn strip_references(text: &str) -> String {
    REFERENCE.replace_all(text, "").trim().to_string()
}

/// Renders a value for interpolation into text.
///
/// Numbers use plain decimal notation, booleans render as `true`/`false`, `null` as
/// the empty string, and structures as compact JSON.
pub fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                // f64's Display never switches to exponent notation.
                n.as_f64().map(|f| f.to_string()).unwrap_or_default()
            }
        }
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Renders a value for a text-only sink: structures become indented JSON.
pub fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Array(_) | JsonValue::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        other => stringify(other),
    }
}

/// Resolves references against a set of step results, collecting warnings.
#[derive(Debug)]
pub struct TemplateResolver<'a> {
    results: &'a StepResults,
    warnings: Vec<String>,
}

impl<'a> TemplateResolver<'a> {
    pub fn new(results: &'a StepResults) -> Self {
        Self {
            results,
            warnings: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    /// Resolves references recursively through strings, lists and mappings.
    pub fn resolve(&mut self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => self.resolve_str(s),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.resolve(v)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves a tool's parameters, applying text coercion for parameters the schema
    /// declares as text sinks.
    pub fn resolve_parameters(
        &mut self,
        params: &Map<String, JsonValue>,
        schema: Option<&ToolSchema>,
    ) -> Map<String, JsonValue> {
        params
            .iter()
            .map(|(name, value)| {
                let resolved = self.resolve(value);
                let is_text_sink = schema
                    .and_then(|s| s.kind_of(name))
                    .is_some_and(|kind| kind.is_text_sink());
                let resolved = if is_text_sink && !resolved.is_string() && !resolved.is_null() {
                    JsonValue::String(to_text(&resolved))
                } else {
                    resolved
                };
                (name.clone(), resolved)
            })
            .collect()
    }

    fn resolve_str(&mut self, text: &str) -> JsonValue {
        if !contains_reference(text) {
            return JsonValue::String(text.to_string());
        }

        let trimmed = text.trim();
        if is_whole_reference(trimmed) {
            let reference = REFERENCE
                .captures(trimmed)
                .and_then(|caps| Reference::from_captures(&caps));
            return match reference {
                Some(reference) => self.lookup(&reference).cloned().unwrap_or(JsonValue::Null),
                None => {
                    self.warn_out_of_range(trimmed);
                    JsonValue::Null
                }
            };
        }

        let substituted = REFERENCE
            .replace_all(text, |caps: &Captures<'_>| {
                match Reference::from_captures(caps) {
                    Some(reference) => self
                        .lookup(&reference)
                        .map(stringify)
                        .unwrap_or_default(),
                    None => {
                        self.warn_out_of_range(caps.get(0).map_or("", |m| m.as_str()));
                        String::new()
                    }
                }
            })
            .into_owned();

        // Substituted outputs may themselves contain reference syntax; it is never
        // re-resolved.
        if contains_reference(&substituted) {
            self.warnings.push(format!(
                "removed reference syntax carried in by a step output in \"{}\"",
                text
            ));
            return JsonValue::String(REFERENCE.replace_all(&substituted, "").into_owned());
        }
        JsonValue::String(substituted)
    }

    fn lookup(&mut self, reference: &Reference) -> Option<&'a JsonValue> {
        let results: &'a StepResults = self.results;
        let Some(result) = results.get(reference.step_id) else {
            self.warn(reference, "step has no result");
            return None;
        };
        let Some(output) = results.output(reference.step_id) else {
            self.warn(
                reference,
                &format!("step finished with status {:?}", result.status),
            );
            return None;
        };
        match lookup(output, &reference.path) {
            Some(value) => Some(value),
            None => {
                self.warn(reference, "path not found in step output");
                None
            }
        }
    }

    fn warn_out_of_range(&mut self, raw: &str) {
        let warning = format!("could not resolve {}: step id is out of range", raw);
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    fn warn(&mut self, reference: &Reference, reason: &str) {
        let warning = format!("could not resolve {}: {}", reference.raw(), reason);
        tracing::warn!(step_id = reference.step_id, path = %reference.path(), "{}", warning);
        self.warnings.push(warning);
    }
}

/// One-shot resolution of `value` against `results`, discarding warnings.
pub fn resolve(value: &JsonValue, results: &StepResults) -> JsonValue {
    TemplateResolver::new(results).resolve(value)
}
