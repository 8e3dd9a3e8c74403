//! Handing queued executions to whatever runs them.

use crate::errors::Result;
use crate::specs::PipelineSpec;
use crate::status::Trigger;
use async_trait::async_trait;

/// A queued execution waiting for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionJob {
    /// The spec as discovered when the job was queued.
    pub spec: PipelineSpec,
    /// Id returned by `queue_execution`.
    pub execution_id: String,
    /// Why it was queued.
    pub trigger: Trigger,
    /// Whether cached step outputs may be reused.
    pub use_cache: bool,
}

/// Receives queued executions.
///
/// The execution is already queued in the status store when `dispatch` is
/// called. An `Err` means the job was not accepted; the scheduler then
/// finishes the execution as failed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Accepts a job.
    async fn dispatch(&self, job: ExecutionJob) -> Result<()>;
}
