//! Status backend trait definition.
//!
//! [`StatusBackend`] is the storage contract shared by the status store and
//! the dependency graph: JSON values under string keys plus string sets.

use crate::errors::StoreError;
use serde_json::Value;

/// Result type for backend operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Name of the set holding every registered pipeline id.
pub const ALL_PIPELINES_KEY: &str = "all-pipelines";

/// Storage contract for pipeline status.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn StatusBackend>`. A single `set` must be atomic: readers see the
/// old value or the new one, never a torn write.
pub trait StatusBackend: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Reads the value stored under `key`.
    ///
    /// Returns `Ok(None)` when nothing has been stored yet.
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Replaces the value stored under `key`.
    fn set(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// Removes `key`, whether it holds a value or a set. Missing keys are fine.
    fn del(&self, key: &str) -> StoreResult<()>;

    /// Adds `member` to the set under `key`.
    fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Removes `member` from the set under `key`.
    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Lists the members of the set under `key`, sorted.
    fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Drops everything this backend stores.
    fn reset(&self) -> StoreResult<()>;

    /// Adds a pipeline id to the registry.
    fn register_pipeline_id(&self, pipeline_id: &str) -> StoreResult<()> {
        self.set_add(ALL_PIPELINES_KEY, pipeline_id)
    }

    /// Removes a pipeline id from the registry.
    fn deregister_pipeline_id(&self, pipeline_id: &str) -> StoreResult<()> {
        self.set_remove(ALL_PIPELINES_KEY, pipeline_id)
    }

    /// Lists every registered pipeline id, sorted.
    fn all_pipeline_ids(&self) -> StoreResult<Vec<String>> {
        self.set_members(ALL_PIPELINES_KEY)
    }
}
