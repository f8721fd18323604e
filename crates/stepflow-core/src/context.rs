use serde::{Deserialize, Serialize};

use crate::types::ContextMap;

/// Variable context for a single run.
///
/// Owned by the executor for the whole run. Steps only ever see a
/// [`snapshot`](Self::snapshot) and hand back a delta that is
/// [`merge`](Self::merge)d in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    data: ContextMap,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded from workflow variables.
    pub fn from_map(data: ContextMap) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Merge a step's output into this context (last writer wins).
    pub fn merge(&mut self, update: &ContextMap) {
        for (k, v) in update {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Copy of the current state, safe to hand to a step.
    pub fn snapshot(&self) -> ContextMap {
        self.data.clone()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &ContextMap {
        &self.data
    }

    pub fn into_inner(self) -> ContextMap {
        self.data
    }
}
