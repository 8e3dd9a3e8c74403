//! Deciding what runs next.
//!
//! Every action starts from a fresh discovery pass so that runnability and
//! dirtiness reflect the current files and the latest recorded executions.
//! Queueing always goes through [`PipelineStatus::queue_execution`], which
//! is what keeps a pipeline from running twice at once.
//!
//! [`PipelineStatus::queue_execution`]: crate::status::PipelineStatus::queue_execution

use super::dispatch::{Dispatcher, ExecutionJob};
use crate::errors::Result;
use crate::orchestrator::Orchestrator;
use crate::specs::{DiscoveryOptions, PipelineSpec, SpecOutcome};
use crate::status::Trigger;
use crate::utils::generate_execution_id;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// What triggered a reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Process start: register everything and clear executions left
    /// unfinished by a previous process.
    Init,
    /// Periodic pass: queue dirty pipelines, up to the batch ceiling.
    Update,
    /// A cron schedule fired for this pipeline.
    Scheduled(String),
    /// This pipeline finished successfully with this trigger.
    Complete {
        /// Finished pipeline.
        pipeline_id: String,
        /// Trigger of the finished execution.
        trigger: Trigger,
    },
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Update => f.write_str("update"),
            Self::Scheduled(id) => write!(f, "scheduled({id})"),
            Self::Complete {
                pipeline_id,
                trigger,
            } => write!(f, "complete({pipeline_id}, {trigger})"),
        }
    }
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pipelines queued and dispatched.
    pub queued: Vec<String>,
    /// Eligible pipelines skipped because an execution was in flight.
    pub busy: Vec<String>,
    /// Pipelines no longer on disk whose status was removed.
    pub deregistered: Vec<String>,
}

/// Decides which pipelines to queue and hands them to a [`Dispatcher`].
#[derive(Clone)]
pub struct DependencyScheduler {
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<dyn Dispatcher>,
    use_cache: bool,
}

impl fmt::Debug for DependencyScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyScheduler")
            .field("orchestrator", &self.orchestrator)
            .field("use_cache", &self.use_cache)
            .finish_non_exhaustive()
    }
}

impl DependencyScheduler {
    /// Scheduler dispatching to `dispatcher`; cached outputs are reused.
    pub fn new(orchestrator: Arc<Orchestrator>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            orchestrator,
            dispatcher,
            use_cache: true,
        }
    }

    /// Sets whether dispatched jobs may reuse cached outputs.
    #[must_use]
    pub const fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Runs one pass for `action`.
    pub async fn reconcile(&self, action: ReconcileAction) -> Result<ReconcileReport> {
        let _pass = self.orchestrator.reconcile_lock().lock().await;
        tracing::debug!(%action, "Reconciling");
        let discovered = self.refresh()?;
        let mut report = ReconcileReport::default();

        match &action {
            ReconcileAction::Init => self.init(&discovered)?,
            ReconcileAction::Update => self.update(&discovered, &mut report).await?,
            ReconcileAction::Scheduled(pipeline_id) => {
                self.scheduled(&discovered, pipeline_id, &mut report).await?;
            }
            ReconcileAction::Complete {
                pipeline_id,
                trigger,
            } => {
                self.complete(&discovered, pipeline_id, *trigger, &mut report)
                    .await?;
            }
        }

        if !report.queued.is_empty() || !report.deregistered.is_empty() {
            tracing::info!(
                %action,
                queued = ?report.queued,
                busy = ?report.busy,
                deregistered = ?report.deregistered,
                "Reconciled"
            );
        }
        Ok(report)
    }

    /// Discovers every pipeline and records its snapshot and edges.
    fn refresh(&self) -> Result<Vec<SpecOutcome>> {
        let discovered: Vec<SpecOutcome> = self
            .orchestrator
            .discover(DiscoveryOptions::default())
            .collect();
        let store = self.orchestrator.status();
        let graph = self.orchestrator.graph();
        for outcome in &discovered {
            let mut status = store.get(outcome.pipeline_id())?;
            status.init(
                outcome.raw_details().clone(),
                outcome.source_details().clone(),
                outcome.errors().to_vec(),
                outcome.cache_hash(),
            );
            status.save()?;
            graph.update(outcome.pipeline_id(), outcome.dependencies())?;
        }
        Ok(discovered)
    }

    fn init(&self, discovered: &[SpecOutcome]) -> Result<()> {
        let store = self.orchestrator.status();
        for outcome in discovered {
            let mut status = store.get(outcome.pipeline_id())?;
            if let Some(execution_id) = status.invalidate_unfinished("Cancelled")? {
                tracing::info!(
                    pipeline_id = outcome.pipeline_id(),
                    execution_id,
                    "Cancelled execution left over from a previous run"
                );
            }
        }
        Ok(())
    }

    async fn update(&self, discovered: &[SpecOutcome], report: &mut ReconcileReport) -> Result<()> {
        let store = self.orchestrator.status();
        let ceiling = self.orchestrator.settings().batch_ceiling.max(1);

        for outcome in discovered {
            if report.queued.len() >= ceiling {
                tracing::debug!(ceiling, "Batch ceiling reached");
                break;
            }
            let Some(spec) = outcome.as_valid() else {
                continue;
            };
            let status = store.get(&spec.pipeline_id)?;
            let never_succeeded = status.last_successful_execution()?.is_none();
            if status.runnable() && (spec.dirty || never_succeeded) {
                self.enqueue(spec, Trigger::DirtyTask, report).await?;
            }
        }

        if report.queued.is_empty() {
            let present: HashSet<&str> = discovered.iter().map(SpecOutcome::pipeline_id).collect();
            for pipeline_id in store.all_pipeline_ids()? {
                if !present.contains(pipeline_id.as_str()) {
                    store.deregister(&pipeline_id)?;
                    self.orchestrator.graph().remove(&pipeline_id)?;
                    report.deregistered.push(pipeline_id);
                }
            }
        }
        Ok(())
    }

    async fn scheduled(
        &self,
        discovered: &[SpecOutcome],
        pipeline_id: &str,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let Some(outcome) = discovered.iter().find(|o| o.pipeline_id() == pipeline_id) else {
            tracing::warn!(pipeline_id, "Scheduled pipeline not found");
            return Ok(());
        };
        match outcome.as_valid() {
            Some(spec) if spec.details.schedule.is_some() => {
                self.enqueue(spec, Trigger::Scheduled, report).await
            }
            Some(_) => {
                tracing::warn!(pipeline_id, "Pipeline has no schedule");
                Ok(())
            }
            None => {
                tracing::warn!(pipeline_id, "Scheduled pipeline is not runnable");
                Ok(())
            }
        }
    }

    async fn complete(
        &self,
        discovered: &[SpecOutcome],
        pipeline_id: &str,
        trigger: Trigger,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let by_id: HashMap<&str, &SpecOutcome> =
            discovered.iter().map(|o| (o.pipeline_id(), o)).collect();
        let graph = self.orchestrator.graph();
        let cascade = if trigger == Trigger::Scheduled {
            Trigger::Scheduled
        } else {
            Trigger::Dependency
        };

        let mut waiting: HashSet<String> = HashSet::new();
        for dependent in graph.transitive_dependents(pipeline_id)? {
            let Some(spec) = by_id.get(dependent.as_str()).and_then(|o| o.as_valid()) else {
                continue;
            };
            // Reached again once the dependency queued in this pass completes.
            if graph
                .dependencies(&dependent)?
                .iter()
                .any(|d| waiting.contains(d))
            {
                waiting.insert(dependent);
                continue;
            }
            if spec.dirty || trigger == Trigger::Scheduled {
                self.enqueue(spec, cascade, report).await?;
                waiting.insert(dependent);
            }
        }
        Ok(())
    }

    /// Queues `spec` and dispatches it, unless an execution is in flight.
    async fn enqueue(
        &self,
        spec: &PipelineSpec,
        trigger: Trigger,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut status = self.orchestrator.status().get(&spec.pipeline_id)?;
        if !status.runnable() {
            return Ok(());
        }
        let execution_id = generate_execution_id();
        if !status.queue_execution(&execution_id, trigger)? {
            report.busy.push(spec.pipeline_id.clone());
            return Ok(());
        }

        let job = ExecutionJob {
            spec: spec.clone(),
            execution_id: execution_id.clone(),
            trigger,
            use_cache: self.use_cache,
        };
        if let Err(e) = self.dispatcher.dispatch(job).await {
            tracing::warn!(pipeline_id = %spec.pipeline_id, error = %e, "Dispatch failed");
            status.invalidate_unfinished(&format!("Dispatch failed: {e}"))?;
            return Ok(());
        }

        tracing::debug!(pipeline_id = %spec.pipeline_id, execution_id, %trigger, "Queued");
        report.queued.push(spec.pipeline_id.clone());
        Ok(())
    }
}
