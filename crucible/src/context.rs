//! `ContextVariables`: the write-wins-last overlay threaded through a
//! session's turns.
//!
//! An unordered mapping from string key to opaque JSON value. The
//! Conversation Loop seeds it from the session plus any per-call overrides,
//! then merges each tool result's `updated_context_variables` into it
//! shallowly — a later write always overwrites an earlier one for the same
//! key, never deep-merged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known keys every `ContextVariables` is expected to carry.
pub mod keys {
    /// The owning session's id.
    pub const SESSION_ID: &str = "sessionId";
    /// The active task's id, if any.
    pub const TASK_ID: &str = "taskId";
    /// Working directory tools should resolve relative paths against.
    pub const WORKING_DIRECTORY: &str = "workingDirectory";
    /// The currently active worker's id.
    pub const CURRENT_AGENT: &str = "currentAgent";
}

/// The write-wins-last context overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextVariables(HashMap<String, Value>);

impl ContextVariables {
    /// An empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an overlay with the four well-known keys.
    #[must_use]
    pub fn with_session(session_id: impl Into<String>, working_directory: impl Into<String>) -> Self {
        let mut vars = Self::new();
        vars.set(keys::SESSION_ID, Value::String(session_id.into()));
        vars.set(keys::WORKING_DIRECTORY, Value::String(working_directory.into()));
        vars
    }

    /// Read a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Read a key as a string, if present and string-typed.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Write (or overwrite) a single key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Shallow-merge `updates` into this overlay, write-wins-last: every
    /// key in `updates` overwrites this overlay's value for that key, and
    /// keys not present in `updates` are left untouched.
    pub fn merge(&mut self, updates: HashMap<String, Value>) {
        for (key, value) in updates {
            self.0.insert(key, value);
        }
    }

    /// Build a new overlay by merging `overrides` onto `self`'s clone,
    /// without mutating `self` — used when a run's options carry
    /// one-off overrides that should not leak into the session's stored
    /// context variables.
    #[must_use]
    pub fn merged_with(&self, overrides: HashMap<String, Value>) -> Self {
        let mut merged = self.clone();
        merged.merge(overrides);
        merged
    }

    /// A read-only view suitable for handing to a tool handler.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.0.clone()
    }

    /// Number of keys currently set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no keys are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_write_wins_last_and_shallow() {
        let mut vars = ContextVariables::new();
        vars.set("a", Value::String("old".into()));
        vars.set("b", Value::String("keep".into()));

        let mut updates = HashMap::new();
        updates.insert("a".to_string(), Value::String("new".into()));
        vars.merge(updates);

        assert_eq!(vars.get_str("a"), Some("new"));
        assert_eq!(vars.get_str("b"), Some("keep"));
    }

    #[test]
    fn merged_with_does_not_mutate_original() {
        let vars = ContextVariables::with_session("s1", "/tmp");
        let mut overrides = HashMap::new();
        overrides.insert("extra".to_string(), Value::Bool(true));
        let merged = vars.merged_with(overrides);

        assert!(vars.get("extra").is_none());
        assert_eq!(merged.get("extra"), Some(&Value::Bool(true)));
    }
}
