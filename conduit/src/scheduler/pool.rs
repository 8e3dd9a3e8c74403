//! In-process workers that run dispatched executions.
//!
//! Jobs go through an unbounded channel; a semaphore caps how many chains
//! run at once. A successful execution feeds a `Complete` reconcile pass
//! back through the same pool, which is how dependents get queued.

use super::dispatch::{Dispatcher, ExecutionJob};
use super::reconcile::{DependencyScheduler, ReconcileAction};
use crate::cancellation::CancellationToken;
use crate::engine;
use crate::errors::{ConduitError, Result};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Counters for the pool's lifetime.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl PoolMetrics {
    /// Jobs accepted.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Executions that finished successfully.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Executions that failed or errored.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs dropped unstarted at shutdown.
    #[must_use]
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Counters as JSON, for logging.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "dispatched": self.dispatched(),
            "succeeded": self.succeeded(),
            "failed": self.failed(),
            "abandoned": self.abandoned(),
        })
    }
}

/// Handle for sending jobs to the workers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<ExecutionJob>,
    metrics: Arc<PoolMetrics>,
}

impl WorkerPool {
    /// Starts `workers` slots. The returned task ends once `cancel` fires
    /// and every running execution has settled.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        workers: usize,
        cancel: Arc<CancellationToken>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            tx,
            metrics: Arc::new(PoolMetrics::default()),
        };
        let handle = tokio::spawn(run_workers(
            pool.clone(),
            orchestrator,
            rx,
            workers.max(1),
            cancel,
        ));
        (pool, handle)
    }

    /// Lifetime counters.
    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

#[async_trait]
impl Dispatcher for WorkerPool {
    async fn dispatch(&self, job: ExecutionJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| ConduitError::Dispatch("worker pool is shut down".to_string()))?;
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

async fn run_workers(
    pool: WorkerPool,
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::UnboundedReceiver<ExecutionJob>,
    workers: usize,
    cancel: Arc<CancellationToken>,
) {
    tracing::info!(workers, "Worker pool started");
    let slots = Arc::new(Semaphore::new(workers));
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Worker task panicked");
                }
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                let permit = tokio::select! {
                    () = cancel.cancelled() => {
                        abandon(&pool, &orchestrator, &job);
                        break;
                    }
                    permit = Arc::clone(&slots).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break };
                running.spawn(run_job(
                    pool.clone(),
                    Arc::clone(&orchestrator),
                    job,
                    Arc::clone(&cancel),
                    permit,
                ));
            }
        }
    }

    rx.close();
    while let Ok(job) = rx.try_recv() {
        abandon(&pool, &orchestrator, &job);
    }
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!(metrics = %pool.metrics.to_json(), "Worker pool stopped");
}

async fn run_job(
    pool: WorkerPool,
    orchestrator: Arc<Orchestrator>,
    job: ExecutionJob,
    cancel: Arc<CancellationToken>,
    permit: OwnedSemaphorePermit,
) {
    let pipeline_id = job.spec.pipeline_id.clone();
    let result = engine::execute(
        &orchestrator,
        &job.spec,
        &job.execution_id,
        job.trigger,
        job.use_cache,
        &cancel,
    )
    .await;
    drop(permit);

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            pool.metrics.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(pipeline_id, error = %e, "Execution errored");
            return;
        }
    };
    if !outcome.success {
        pool.metrics.failed.fetch_add(1, Ordering::Relaxed);
        return;
    }
    pool.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
    if cancel.is_cancelled() {
        return;
    }

    let trigger = job.trigger;
    let scheduler = DependencyScheduler::new(orchestrator, Arc::new(pool));
    let action = ReconcileAction::Complete {
        pipeline_id: pipeline_id.clone(),
        trigger,
    };
    if let Err(e) = scheduler.reconcile(action).await {
        tracing::warn!(pipeline_id, error = %e, "Dependent reconcile failed");
    }
}

/// Finishes a queued job that will never start.
fn abandon(pool: &WorkerPool, orchestrator: &Orchestrator, job: &ExecutionJob) {
    pool.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
    let result = orchestrator
        .status()
        .get(&job.spec.pipeline_id)
        .and_then(|mut status| status.invalidate_unfinished("Cancelled"));
    if let Err(e) = result {
        tracing::warn!(pipeline_id = %job.spec.pipeline_id, error = %e, "Failed to cancel queued job");
    }
}
