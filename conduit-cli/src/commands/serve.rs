use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conduit::scheduler::{DependencyScheduler, ReconcileAction, WorkerPool};
use tokio::time::MissedTickBehavior;

/// Execute the `serve` command: reconcile on an interval until Ctrl-C.
pub async fn execute(workers: usize, interval_secs: u64) -> Result<ExitCode> {
    let orchestrator = super::orchestrator()?;
    let cancel = super::cancel_on_ctrl_c();
    let (pool, workers_done) =
        WorkerPool::start(Arc::clone(&orchestrator), workers, Arc::clone(&cancel));
    let scheduler = DependencyScheduler::new(Arc::clone(&orchestrator), Arc::new(pool.clone()));

    scheduler
        .reconcile(ReconcileAction::Init)
        .await
        .context("Initial reconcile failed")?;

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = scheduler.reconcile(ReconcileAction::Update).await {
                    tracing::error!(error = %e, "Update pass failed");
                }
            }
        }
    }

    workers_done.await.context("Worker pool panicked")?;
    println!("Stopped. {}", pool.metrics().to_json());
    Ok(ExitCode::SUCCESS)
}
