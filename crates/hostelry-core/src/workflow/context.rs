//! Shared execution context passed to step handlers.
//!
//! `WorkflowContext` is the side channel through which steps hand data to
//! later steps: each handler receives a clone of the same handle and may read
//! or write entries. The engine deep-copies the caller's input when an
//! execution is created, so the caller's map is never aliased.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

/// Cheaply clonable handle over a concurrent JSON map.
///
/// All clones observe the same entries.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    entries: Arc<DashMap<String, Value>>,
}

impl WorkflowContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context owning an independent copy of `input`.
    pub fn from_map(input: &Map<String, Value>) -> Self {
        let entries = DashMap::with_capacity(input.len());
        for (key, value) in input {
            entries.insert(key.clone(), value.clone());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Get a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Get a string value stored under `key`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .and_then(|v| v.value().as_str().map(str::to_string))
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered point-in-time copy of all entries.
    pub fn to_map(&self) -> Map<String, Value> {
        let ordered: BTreeMap<String, Value> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        ordered.into_iter().collect()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Serialized JSON size in bytes.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.to_value()).map_or(0, |bytes| bytes.len())
    }

    /// Key under which the engine stores a step's result.
    pub fn result_key(step_name: &str) -> String {
        format!("{step_name}_result")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
