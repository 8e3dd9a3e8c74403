//! In-process backend used by tests and embedders that need no persistence.

use super::backend::{StatusBackend, StoreResult};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeSet;

/// Backend keeping everything in concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    values: DashMap<String, Value>,
    sets: DashMap<String, BTreeSet<String>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusBackend for InMemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        self.values.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn reset(&self) -> StoreResult<()> {
        self.values.clear();
        self.sets.clear();
        Ok(())
    }
}
