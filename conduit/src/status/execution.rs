//! A single run attempt of a pipeline and its lifecycle transitions.

use super::backend::{StatusBackend, StoreResult};
use crate::errors::StoreError;
use crate::utils::{now_utc, seconds_between, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Why an execution was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    /// Started by a person, usually through the CLI.
    Manual,
    /// Fired by the pipeline's schedule.
    Scheduled,
    /// Cascaded from a dependency that just completed.
    Dependency,
    /// Picked up by an update pass because the pipeline was dirty.
    DirtyTask,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::Dependency => "dependency",
            Self::DirtyTask => "dirty-task",
        };
        write!(f, "{s}")
    }
}

/// Persisted record of one run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Pipeline this execution belongs to.
    pub pipeline_id: String,
    /// Snapshot of the pipeline details when queued.
    pub pipeline_details: Value,
    /// Spec hash this execution ran against.
    pub cache_hash: String,
    /// What queued it.
    pub trigger: Trigger,
    /// Opaque unique token.
    pub execution_id: String,
    /// Rolling progress log.
    #[serde(default)]
    pub log: String,
    /// When it was queued.
    #[serde(default)]
    pub queue_time: Option<Timestamp>,
    /// When it started.
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    /// When it finished.
    #[serde(default)]
    pub finish_time: Option<Timestamp>,
    /// Outcome; `None` until finished.
    #[serde(default)]
    pub success: Option<bool>,
    /// Aggregated statistics reported by the chain.
    #[serde(default)]
    pub stats: Map<String, Value>,
    /// Error lines of the failing step.
    #[serde(default)]
    pub error_log: Vec<String>,
}

impl PipelineExecution {
    /// Store key of an execution record.
    #[must_use]
    pub fn key(execution_id: &str) -> String {
        format!("PipelineExecution:{execution_id}")
    }

    /// Creates an execution that has not been queued yet.
    #[must_use]
    pub fn new(
        pipeline_id: impl Into<String>,
        pipeline_details: Value,
        cache_hash: impl Into<String>,
        trigger: Trigger,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            pipeline_details,
            cache_hash: cache_hash.into(),
            trigger,
            execution_id: execution_id.into(),
            log: String::new(),
            queue_time: None,
            start_time: None,
            finish_time: None,
            success: None,
            stats: Map::new(),
            error_log: Vec::new(),
        }
    }

    /// Loads an execution record, if present.
    pub fn load(backend: &dyn StatusBackend, execution_id: &str) -> StoreResult<Option<Self>> {
        let key = Self::key(execution_id);
        match backend.get(&key)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    /// Persists this record.
    pub fn save(&self, backend: &dyn StatusBackend) -> StoreResult<()> {
        backend.set(&Self::key(&self.execution_id), &serde_json::to_value(self)?)
    }

    /// Removes this record.
    pub fn delete(&self, backend: &dyn StatusBackend) -> StoreResult<()> {
        backend.del(&Self::key(&self.execution_id))
    }

    /// Whether `queue` has been called.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.queue_time.is_some()
    }

    /// Whether `start` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.start_time.is_some()
    }

    /// Whether `finish` has been called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }

    /// True if unfinished and queued (or started) longer ago than `window`.
    #[must_use]
    pub fn is_stale(&self, window: Duration, now: Timestamp) -> bool {
        if self.is_finished() {
            return false;
        }
        let since = self.start_time.or(self.queue_time);
        since.map_or(false, |t| seconds_between(t, now) > window.as_secs())
    }

    /// Marks the execution queued. Returns false if it already was.
    pub fn queue(&mut self) -> bool {
        if self.is_queued() {
            return false;
        }
        self.queue_time = Some(now_utc());
        true
    }

    /// Marks the execution started. Requires queued and not yet started.
    pub fn start(&mut self) -> bool {
        if !self.is_queued() || self.is_started() {
            return false;
        }
        self.start_time = Some(now_utc());
        true
    }

    /// Replaces the progress log. Requires started and unfinished.
    pub fn update(&mut self, log: String) -> bool {
        if !self.is_started() || self.is_finished() {
            return false;
        }
        self.log = log;
        true
    }

    /// Records the outcome. Requires started and unfinished.
    pub fn finish(
        &mut self,
        success: bool,
        stats: Map<String, Value>,
        error_log: Vec<String>,
    ) -> bool {
        if !self.is_started() || self.is_finished() {
            return false;
        }
        self.finish_time = Some(now_utc());
        self.success = Some(success);
        self.stats = stats;
        self.error_log = error_log;
        true
    }

    /// Forces an unfinished execution into a finished, failed state.
    pub fn invalidate(&mut self, reason: &str) {
        if self.is_finished() {
            return;
        }
        let now = now_utc();
        self.queue_time.get_or_insert(now);
        self.start_time.get_or_insert(now);
        self.finish_time = Some(now);
        self.success = Some(false);
        self.stats = Map::new();
        self.error_log = vec![reason.to_string()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::memory::InMemoryBackend;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn execution() -> PipelineExecution {
        PipelineExecution::new("./p", json!({"pipeline": []}), "h1", Trigger::Manual, "e1")
    }

    #[test]
    fn test_trigger_serialization() {
        assert_eq!(serde_json::to_value(Trigger::DirtyTask).unwrap(), "dirty-task");
        assert_eq!(Trigger::Scheduled.to_string(), "scheduled");
        let t: Trigger = serde_json::from_value(json!("dependency")).unwrap();
        assert_eq!(t, Trigger::Dependency);
    }

    #[test]
    fn test_transitions_are_guarded() {
        let mut exec = execution();
        assert!(!exec.start(), "cannot start before queue");
        assert!(!exec.finish(true, Map::new(), vec![]), "cannot finish before start");

        assert!(exec.queue());
        assert!(!exec.queue());
        assert!(exec.start());
        assert!(!exec.start());
        assert!(exec.update("step: line".to_string()));
        assert!(exec.finish(true, Map::new(), vec![]));
        assert!(!exec.finish(false, Map::new(), vec![]));
        assert!(!exec.update("late".to_string()));
        assert_eq!(exec.success, Some(true));
        assert_eq!(exec.log, "step: line");
    }

    #[test]
    fn test_staleness() {
        let mut exec = execution();
        let window = Duration::from_secs(86_400);
        assert!(!exec.is_stale(window, now_utc()), "never queued is not stale");

        exec.queue();
        assert!(!exec.is_stale(window, now_utc()));
        let later = now_utc() + ChronoDuration::seconds(86_401);
        assert!(exec.is_stale(window, later));

        exec.start();
        exec.finish(false, Map::new(), vec![]);
        assert!(!exec.is_stale(window, later), "finished is never stale");
    }

    #[test]
    fn test_invalidate() {
        let mut exec = execution();
        exec.queue();
        exec.invalidate("Cancelled");
        assert!(exec.is_finished());
        assert_eq!(exec.success, Some(false));
        assert_eq!(exec.error_log, vec!["Cancelled"]);
    }

    #[test]
    fn test_save_load_delete() {
        let backend = InMemoryBackend::new();
        let mut exec = execution();
        exec.queue();
        exec.save(&backend).unwrap();

        let loaded = PipelineExecution::load(&backend, "e1").unwrap().unwrap();
        assert_eq!(loaded, exec);

        loaded.delete(&backend).unwrap();
        assert!(PipelineExecution::load(&backend, "e1").unwrap().is_none());
    }
}
