//! Per-pipeline status record and the guarded execution lifecycle.
//!
//! `queue_execution` is the only mutual-exclusion point between runs of the
//! same pipeline: it refuses to queue while the head of the history is
//! unfinished and not yet stale. Every later transition checks that the
//! execution id is still the head before writing, which makes the pair an
//! optimistic compare-and-set with the staleness window as the fallback.

use super::backend::{StatusBackend, StoreResult};
use super::execution::{PipelineExecution, Trigger};
use super::hooks::{hook_urls, HookEvent, HookPayload, HookSender};
use crate::errors::{SpecError, StoreError};
use crate::utils::now_utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Persisted shape of a pipeline's status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Last known pipeline details.
    #[serde(default)]
    pub pipeline_details: Value,
    /// Source document the pipeline was generated from, if any.
    #[serde(default)]
    pub source_details: Value,
    /// Validation errors of the last discovery.
    #[serde(default)]
    pub validation_errors: Vec<SpecError>,
    /// Spec hash of the last discovery.
    #[serde(default)]
    pub cache_hash: String,
    /// Execution ids, most recent first.
    #[serde(default)]
    pub executions: Vec<String>,
}

/// Derived lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Has validation errors.
    Invalid,
    /// Valid but never queued.
    Init,
    /// Head execution waiting to start.
    Queued,
    /// Head execution running.
    Running,
    /// Head execution succeeded.
    Succeeded,
    /// Head execution failed.
    Failed,
}

impl PipelineState {
    /// Returns true if the head execution has not finished.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalid => "INVALID",
            Self::Init => "INIT",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// History and staleness limits applied by a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLimits {
    /// Executions kept per pipeline.
    pub history_limit: usize,
    /// Age after which an unfinished execution may be cancelled.
    pub stale_after: Duration,
}

impl Default for StatusLimits {
    fn default() -> Self {
        Self {
            history_limit: 10,
            stale_after: Duration::from_secs(86_400),
        }
    }
}

/// A pipeline's status bound to the backend it lives in.
pub struct PipelineStatus {
    pipeline_id: String,
    record: StatusRecord,
    backend: Arc<dyn StatusBackend>,
    hooks: HookSender,
    limits: StatusLimits,
}

impl fmt::Debug for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStatus")
            .field("pipeline_id", &self.pipeline_id)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl PipelineStatus {
    /// Store key of a status record.
    #[must_use]
    pub fn key(pipeline_id: &str) -> String {
        format!("PipelineStatus:{pipeline_id}")
    }

    /// Loads the status of `pipeline_id`, or an empty one if none is stored.
    pub(crate) fn load(
        pipeline_id: &str,
        backend: Arc<dyn StatusBackend>,
        hooks: HookSender,
        limits: StatusLimits,
    ) -> StoreResult<Self> {
        let record = read_record(backend.as_ref(), pipeline_id)?.unwrap_or_default();
        Ok(Self {
            pipeline_id: pipeline_id.to_string(),
            record,
            backend,
            hooks,
            limits,
        })
    }

    /// Pipeline id.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Current record.
    #[must_use]
    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    /// Spec hash recorded by the last discovery.
    #[must_use]
    pub fn cache_hash(&self) -> &str {
        &self.record.cache_hash
    }

    /// Validation errors recorded by the last discovery.
    #[must_use]
    pub fn validation_errors(&self) -> &[SpecError] {
        &self.record.validation_errors
    }

    /// Execution ids, most recent first.
    #[must_use]
    pub fn execution_ids(&self) -> &[String] {
        &self.record.executions
    }

    /// Replaces the spec snapshot. Call [`PipelineStatus::save`] to persist.
    pub fn init(
        &mut self,
        pipeline_details: Value,
        source_details: Value,
        validation_errors: Vec<SpecError>,
        cache_hash: impl Into<String>,
    ) {
        self.record.pipeline_details = pipeline_details;
        self.record.source_details = source_details;
        self.record.validation_errors = validation_errors;
        self.record.cache_hash = cache_hash.into();
    }

    /// Persists the spec snapshot and registers the pipeline id.
    ///
    /// The execution history is taken from the store, not from this handle,
    /// so a snapshot loaded before another handle queued an execution never
    /// drops that execution.
    pub fn save(&mut self) -> StoreResult<()> {
        if let Some(stored) = read_record(self.backend.as_ref(), &self.pipeline_id)? {
            self.record.executions = stored.executions;
        }
        self.persist()
    }

    fn persist(&self) -> StoreResult<()> {
        self.backend
            .set(&Self::key(&self.pipeline_id), &serde_json::to_value(&self.record)?)?;
        self.backend.register_pipeline_id(&self.pipeline_id)
    }

    /// No validation errors.
    #[must_use]
    pub fn runnable(&self) -> bool {
        self.record.validation_errors.is_empty()
    }

    /// No executions, or the head ran against a different hash.
    pub fn dirty(&self) -> StoreResult<bool> {
        self.dirty_for(&self.record.cache_hash)
    }

    /// Same as [`PipelineStatus::dirty`] for a hash not yet recorded.
    pub fn dirty_for(&self, cache_hash: &str) -> StoreResult<bool> {
        Ok(self
            .last_execution()?
            .map_or(true, |last| last.cache_hash != cache_hash))
    }

    /// Head of the history.
    pub fn last_execution(&self) -> StoreResult<Option<PipelineExecution>> {
        match self.record.executions.first() {
            None => Ok(None),
            Some(eid) => PipelineExecution::load(self.backend.as_ref(), eid),
        }
    }

    /// Most recent execution that finished successfully.
    pub fn last_successful_execution(&self) -> StoreResult<Option<PipelineExecution>> {
        for eid in &self.record.executions {
            if let Some(exec) = PipelineExecution::load(self.backend.as_ref(), eid)? {
                if exec.success == Some(true) {
                    return Ok(Some(exec));
                }
            }
        }
        Ok(None)
    }

    /// All executions still in the history, most recent first.
    pub fn executions(&self) -> StoreResult<Vec<PipelineExecution>> {
        let mut out = Vec::with_capacity(self.record.executions.len());
        for eid in &self.record.executions {
            if let Some(exec) = PipelineExecution::load(self.backend.as_ref(), eid)? {
                out.push(exec);
            }
        }
        Ok(out)
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> StoreResult<PipelineState> {
        if !self.runnable() {
            return Ok(PipelineState::Invalid);
        }
        Ok(match self.last_execution()? {
            None => PipelineState::Init,
            Some(exec) if exec.is_finished() => {
                if exec.success == Some(true) {
                    PipelineState::Succeeded
                } else {
                    PipelineState::Failed
                }
            }
            Some(exec) if exec.is_started() => PipelineState::Running,
            Some(_) => PipelineState::Queued,
        })
    }

    /// Validation errors, or the head execution's error log.
    pub fn errors(&self) -> StoreResult<Vec<String>> {
        if !self.runnable() {
            return Ok(self
                .record
                .validation_errors
                .iter()
                .map(ToString::to_string)
                .collect());
        }
        Ok(self
            .last_execution()?
            .map(|exec| exec.error_log)
            .unwrap_or_default())
    }

    /// Queues a new execution unless one is already in flight.
    ///
    /// An unfinished head older than the staleness window is finished as
    /// failed with `Cancelled` first. Returns `Ok(false)` when the pipeline
    /// is busy.
    pub fn queue_execution(&mut self, execution_id: &str, trigger: Trigger) -> StoreResult<bool> {
        if let Some(stored) = read_record(self.backend.as_ref(), &self.pipeline_id)? {
            self.record.executions = stored.executions;
        }

        if let Some(mut last) = self.last_execution()? {
            if !last.is_finished() {
                if !last.is_stale(self.limits.stale_after, now_utc()) {
                    tracing::debug!(
                        pipeline_id = %self.pipeline_id,
                        running = %last.execution_id,
                        "Execution already in flight"
                    );
                    return Ok(false);
                }
                tracing::info!(
                    pipeline_id = %self.pipeline_id,
                    execution_id = %last.execution_id,
                    "Cancelling stale execution"
                );
                last.invalidate("Cancelled");
                last.save(self.backend.as_ref())?;
            }
        }

        let mut execution = PipelineExecution::new(
            self.pipeline_id.clone(),
            self.record.pipeline_details.clone(),
            self.record.cache_hash.clone(),
            trigger,
            execution_id,
        );
        execution.queue();
        execution.save(self.backend.as_ref())?;

        self.record.executions.insert(0, execution_id.to_string());
        while self.record.executions.len() > self.limits.history_limit.max(1) {
            if let Some(evicted) = self.record.executions.pop() {
                self.backend.del(&PipelineExecution::key(&evicted))?;
            }
        }
        self.persist()?;

        self.fire(&HookPayload::new(&self.pipeline_id, HookEvent::Queue));
        Ok(true)
    }

    /// Marks the execution started if it is still the queued head.
    pub fn start_execution(&mut self, execution_id: &str) -> StoreResult<bool> {
        let Some(mut execution) = self.head_execution(execution_id)? else {
            return Ok(false);
        };
        if !execution.start() {
            return Ok(false);
        }
        execution.save(self.backend.as_ref())?;
        self.fire(&HookPayload::new(&self.pipeline_id, HookEvent::Start));
        Ok(true)
    }

    /// Stores the progress log if the execution is still the running head.
    pub fn update_execution(
        &mut self,
        execution_id: &str,
        log: &[String],
        hooks: bool,
    ) -> StoreResult<bool> {
        let Some(mut execution) = self.head_execution(execution_id)? else {
            return Ok(false);
        };
        let text = log.join("\n");
        if !execution.update(text) {
            return Ok(false);
        }
        execution.save(self.backend.as_ref())?;
        if hooks {
            self.fire(&HookPayload::new(&self.pipeline_id, HookEvent::Progress).with_log(&execution.log));
        }
        Ok(true)
    }

    /// Records the outcome if the execution is still the running head.
    pub fn finish_execution(
        &mut self,
        execution_id: &str,
        success: bool,
        stats: Map<String, Value>,
        error_log: Vec<String>,
    ) -> StoreResult<bool> {
        let Some(mut execution) = self.head_execution(execution_id)? else {
            return Ok(false);
        };
        if !execution.finish(success, stats.clone(), error_log.clone()) {
            return Ok(false);
        }
        execution.save(self.backend.as_ref())?;
        self.fire(
            &HookPayload::new(&self.pipeline_id, HookEvent::Finish)
                .with_outcome(success, error_log, stats)
                .with_log(&execution.log),
        );
        Ok(true)
    }

    /// Finishes an unfinished head execution as failed with `reason`.
    ///
    /// Returns the id of the execution that was invalidated, if any.
    pub fn invalidate_unfinished(&mut self, reason: &str) -> StoreResult<Option<String>> {
        match self.last_execution()? {
            Some(mut last) if !last.is_finished() => {
                last.invalidate(reason);
                last.save(self.backend.as_ref())?;
                Ok(Some(last.execution_id))
            }
            _ => Ok(None),
        }
    }

    /// Removes the record and every execution in its history.
    pub(crate) fn delete(&self) -> StoreResult<()> {
        for eid in &self.record.executions {
            self.backend.del(&PipelineExecution::key(eid))?;
        }
        self.backend.del(&Self::key(&self.pipeline_id))?;
        self.backend.deregister_pipeline_id(&self.pipeline_id)
    }

    /// Loads `execution_id` if the stored history still has it at the head.
    fn head_execution(&mut self, execution_id: &str) -> StoreResult<Option<PipelineExecution>> {
        if let Some(stored) = read_record(self.backend.as_ref(), &self.pipeline_id)? {
            self.record.executions = stored.executions;
        }
        if self.record.executions.first().map(String::as_str) != Some(execution_id) {
            tracing::warn!(
                pipeline_id = %self.pipeline_id,
                execution_id,
                "Execution is no longer the head of the history"
            );
            return Ok(None);
        }
        PipelineExecution::load(self.backend.as_ref(), execution_id)
    }

    fn fire(&self, payload: &HookPayload) {
        let urls = hook_urls(&self.record.pipeline_details);
        self.hooks.send(&urls, payload);
    }
}

fn read_record(backend: &dyn StatusBackend, pipeline_id: &str) -> StoreResult<Option<StatusRecord>> {
    let key = PipelineStatus::key(pipeline_id);
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
