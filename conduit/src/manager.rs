//! Running a selection of pipelines on demand.
//!
//! [`run_pipelines`] is what the CLI `run` command calls. Selected pipelines
//! start in dependency order: one whose selected dependencies are still in
//! flight or pending waits for them, and is rediscovered right before it
//! starts so that its dependency checks see the fresh results.

use crate::cancellation::CancellationToken;
use crate::engine::{self, ExecutionOutcome};
use crate::errors::{ConduitError, Result};
use crate::orchestrator::Orchestrator;
use crate::specs::{DiscoveryOptions, PipelineSpec, SpecOutcome};
use crate::status::Trigger;
use crate::utils::generate_execution_id;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Which pipelines a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSelector {
    /// Every discovered pipeline.
    All,
    /// Dirty pipelines, plus those blocked only by a dirty dependency.
    Dirty,
    /// Ids starting with the prefix.
    Prefix(String),
    /// One pipeline.
    Exact(String),
}

impl PipelineSelector {
    /// Parses a CLI target: `all`, `dirty`, `<prefix>*`, `<prefix>%` or an
    /// id. Ids and prefixes without a leading `./` get one.
    #[must_use]
    pub fn parse(target: &str) -> Self {
        match target {
            "all" => Self::All,
            "dirty" => Self::Dirty,
            _ => match target.strip_suffix(['*', '%']) {
                Some(prefix) => Self::Prefix(qualify(prefix)),
                None => Self::Exact(qualify(target)),
            },
        }
    }

    /// Whether `outcome` is selected.
    #[must_use]
    pub fn matches(&self, outcome: &SpecOutcome) -> bool {
        match self {
            Self::All => true,
            Self::Dirty => {
                outcome.dirty()
                    || outcome
                        .errors()
                        .iter()
                        .any(|e| e.short == "Dirty dependency")
            }
            Self::Prefix(prefix) => outcome.pipeline_id().starts_with(prefix.as_str()),
            Self::Exact(id) => outcome.pipeline_id() == id,
        }
    }
}

impl fmt::Display for PipelineSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Dirty => f.write_str("dirty"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Exact(id) => f.write_str(id),
        }
    }
}

fn qualify(target: &str) -> String {
    if target.starts_with("./") {
        target.to_string()
    } else {
        format!("./{}", target.trim_start_matches('/'))
    }
}

/// Knobs for [`run_pipelines`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Resume from cached step outputs where possible.
    pub use_cache: bool,
    /// Ignore unresolved dependencies when hashing.
    pub force: bool,
    /// How many pipelines may run at once.
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force: false,
            concurrency: 1,
        }
    }
}

/// How a selected pipeline ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultKind {
    /// The chain ran, successfully or not.
    Completed,
    /// Validation errors kept it from running.
    Invalid,
    /// Another execution was in flight.
    AlreadyRunning,
}

/// Per-pipeline result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Pipeline id.
    pub pipeline_id: String,
    /// Outcome category.
    pub kind: ResultKind,
    /// Whether the chain succeeded.
    pub success: bool,
    /// Statistics from the end of the stream.
    pub stats: Map<String, Value>,
    /// Error lines, first offending step first.
    pub errors: Vec<String>,
}

impl ExecutionResult {
    fn completed(pipeline_id: String, outcome: ExecutionOutcome) -> Self {
        Self {
            pipeline_id,
            kind: ResultKind::Completed,
            success: outcome.success,
            stats: outcome.stats,
            errors: outcome.error_log,
        }
    }

    fn invalid(outcome: &SpecOutcome) -> Self {
        let errors = std::iter::once("init".to_string())
            .chain(outcome.errors().iter().map(ToString::to_string))
            .collect();
        Self {
            pipeline_id: outcome.pipeline_id().to_string(),
            kind: ResultKind::Invalid,
            success: false,
            stats: Map::new(),
            errors,
        }
    }

    fn already_running(pipeline_id: String) -> Self {
        let outcome = ExecutionOutcome::already_running();
        Self {
            kind: ResultKind::AlreadyRunning,
            ..Self::completed(pipeline_id, outcome)
        }
    }

    /// Succeeded with an empty error log.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.success && self.errors.is_empty()
    }
}

type Running = JoinHandle<(String, Result<ExecutionOutcome>)>;

/// Runs every pipeline matched by `selector` and returns one result per
/// pipeline, in completion order.
///
/// Cancelling `cancel` kills the running chains; pending pipelines are not
/// started and get no result.
pub async fn run_pipelines(
    orchestrator: Arc<Orchestrator>,
    selector: &PipelineSelector,
    options: RunOptions,
    cancel: Arc<CancellationToken>,
) -> Result<Vec<ExecutionResult>> {
    let discovery = discovery_options(options);
    let selected: Vec<SpecOutcome> = orchestrator
        .discover(discovery)
        .filter(|outcome| selector.matches(outcome))
        .collect();
    let selected_ids: HashSet<String> = selected
        .iter()
        .map(|o| o.pipeline_id().to_string())
        .collect();
    tracing::info!(%selector, count = selected.len(), "Running pipelines");

    let mut pending: Vec<(String, Vec<String>)> = selected
        .iter()
        .map(|o| {
            let deps = o
                .dependencies()
                .iter()
                .filter(|d| selected_ids.contains(*d))
                .cloned()
                .collect();
            (o.pipeline_id().to_string(), deps)
        })
        .collect();
    let mut unfinished: HashSet<String> = selected_ids;
    let mut running: FuturesUnordered<Running> = FuturesUnordered::new();
    let mut results = Vec::new();
    let slots = options.concurrency.max(1);

    loop {
        while running.len() < slots && !cancel.is_cancelled() {
            let Some(pipeline_id) = next_ready(&mut pending, &unfinished, running.is_empty())
            else {
                break;
            };
            match start(&orchestrator, &pipeline_id, options, &cancel)? {
                Started::Running(handle) => running.push(handle),
                Started::Done(result) => {
                    unfinished.remove(&result.pipeline_id);
                    results.push(result);
                }
            }
        }

        let Some(joined) = running.next().await else {
            break;
        };
        let (pipeline_id, outcome) =
            joined.map_err(|e| ConduitError::Internal(format!("execution task failed: {e}")))?;
        let result = match outcome {
            Ok(outcome) => ExecutionResult::completed(pipeline_id, outcome),
            Err(e) => {
                tracing::error!(pipeline_id, error = %e, "Execution errored");
                ExecutionResult::completed(
                    pipeline_id,
                    ExecutionOutcome::failed(vec!["Execution error".to_string(), e.to_string()]),
                )
            }
        };
        tracing::info!(
            pipeline_id = %result.pipeline_id,
            success = result.success,
            "Pipeline finished"
        );
        unfinished.remove(&result.pipeline_id);
        results.push(result);
    }

    if !pending.is_empty() {
        tracing::warn!(skipped = pending.len(), "Run cancelled before every pipeline started");
    }
    Ok(results)
}

fn discovery_options(options: RunOptions) -> DiscoveryOptions {
    if options.force {
        DiscoveryOptions::ignoring_dependencies()
    } else {
        DiscoveryOptions::default()
    }
}

/// Takes the first pending pipeline whose selected dependencies are done.
/// With nothing in flight the first pending one goes regardless, so a
/// dependency cycle cannot stall the run.
fn next_ready(
    pending: &mut Vec<(String, Vec<String>)>,
    unfinished: &HashSet<String>,
    idle: bool,
) -> Option<String> {
    let ready = pending
        .iter()
        .position(|(_, deps)| deps.iter().all(|d| !unfinished.contains(d)));
    let index = match ready {
        Some(index) => index,
        None if idle && !pending.is_empty() => 0,
        None => return None,
    };
    Some(pending.remove(index).0)
}

enum Started {
    Running(Running),
    Done(ExecutionResult),
}

fn start(
    orchestrator: &Arc<Orchestrator>,
    pipeline_id: &str,
    options: RunOptions,
    cancel: &Arc<CancellationToken>,
) -> Result<Started> {
    orchestrator.resolver().clear();
    let Some(outcome) = orchestrator
        .discover(discovery_options(options))
        .find(|o| o.pipeline_id() == pipeline_id)
    else {
        tracing::warn!(pipeline_id, "Pipeline disappeared before it could start");
        return Ok(Started::Done(ExecutionResult {
            pipeline_id: pipeline_id.to_string(),
            kind: ResultKind::Invalid,
            success: false,
            stats: Map::new(),
            errors: vec!["init".to_string(), "Pipeline not found".to_string()],
        }));
    };

    let mut status = orchestrator.status().get(pipeline_id)?;
    status.init(
        outcome.raw_details().clone(),
        outcome.source_details().clone(),
        outcome.errors().to_vec(),
        outcome.cache_hash(),
    );
    status.save()?;

    let spec: PipelineSpec = match outcome {
        SpecOutcome::Valid(spec) => spec,
        invalid @ SpecOutcome::Invalid(_) => {
            tracing::warn!(pipeline_id, errors = ?invalid.errors(), "Pipeline is invalid");
            return Ok(Started::Done(ExecutionResult::invalid(&invalid)));
        }
    };

    let execution_id = generate_execution_id();
    if !status.queue_execution(&execution_id, Trigger::Manual)? {
        tracing::warn!(pipeline_id, "Pipeline is already running");
        return Ok(Started::Done(ExecutionResult::already_running(
            pipeline_id.to_string(),
        )));
    }

    tracing::info!(pipeline_id, execution_id, "Starting pipeline");
    let orchestrator = Arc::clone(orchestrator);
    let cancel = Arc::clone(cancel);
    Ok(Started::Running(tokio::spawn(async move {
        let outcome = engine::execute(
            &orchestrator,
            &spec,
            &execution_id,
            Trigger::Manual,
            options.use_cache,
            &cancel,
        )
        .await;
        (spec.pipeline_id, outcome)
    })))
}
