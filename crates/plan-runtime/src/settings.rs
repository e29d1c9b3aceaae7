//! Read-only configuration snapshots handed to tools.
//!
//! Tools never reach into global state. A run captures one `Arc<ToolSettings>` when it
//! starts and passes it to every invocation through [`crate::tool::ToolContext`].
//! Reloading configuration means building a new snapshot and swapping it into the
//! [`SettingsHandle`]; runs already in flight keep the snapshot they started with.

use arc_swap::ArcSwap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable key/value settings for tools (account names, default folders, API
/// endpoints, ...). Values are JSON so any tool can read its own section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(flatten)]
    values: HashMap<String, JsonValue>,
}

impl ToolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get_raw(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    /// Reads and deserializes a setting. Returns `None` when the key is missing or the
    /// value does not have the requested shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Live-swappable holder of the current [`ToolSettings`].
///
/// Readers never block; `store` atomically replaces the pointer.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<ToolSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: ToolSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Returns the snapshot a new run should capture.
    pub fn snapshot(&self) -> Arc<ToolSettings> {
        self.inner.load_full()
    }

    /// Swaps in a new snapshot. Only runs started afterwards observe it.
    pub fn store(&self, settings: ToolSettings) {
        self.inner.store(Arc::new(settings));
        tracing::info!("tool settings swapped");
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(ToolSettings::default())
    }
}

impl std::fmt::Debug for SettingsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsHandle")
            .field("current", &*self.inner.load())
            .finish()
    }
}
