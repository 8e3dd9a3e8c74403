//! A dispatcher that records jobs instead of running them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{ConduitError, Result};
use crate::scheduler::{Dispatcher, ExecutionJob};

/// Records every dispatched job. Can be told to refuse jobs.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<ExecutionJob>>,
    refuse: AtomicBool,
}

impl RecordingDispatcher {
    /// Creates a dispatcher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent dispatches fail.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Jobs received so far.
    #[must_use]
    pub fn jobs(&self) -> Vec<ExecutionJob> {
        self.jobs.lock().clone()
    }

    /// Pipeline ids of the jobs received so far, in order.
    #[must_use]
    pub fn pipeline_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .iter()
            .map(|job| job.spec.pipeline_id.clone())
            .collect()
    }

    /// Drains the recorded jobs.
    pub fn take(&self) -> Vec<ExecutionJob> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: ExecutionJob) -> Result<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConduitError::Dispatch("refused".to_string()));
        }
        self.jobs.lock().push(job);
        Ok(())
    }
}
