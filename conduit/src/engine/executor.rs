//! Running one pipeline execution end to end.
//!
//! [`execute`] spawns the chain, then a single supervisor loop waits on
//! every process exit, the progress ticker and the cancellation token at
//! once. The first failing process gets every other one killed. Stream
//! tasks (stderr readers, tees, the sink) run beside it and are collected
//! once all processes are gone.

use super::cache;
use super::chain::{self, Chain, ChainContext, ChainStep, Feed, Spawned, Transfer};
use super::log::{FirstError, RollingLog, StepLog};
use super::wire;
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::observability::SpanTimer;
use crate::orchestrator::Orchestrator;
use crate::specs::PipelineSpec;
use crate::status::{PipelineStatus, Trigger};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Step name of the terminal reader.
pub const SINK: &str = "(sink)";

/// How long stream tasks may linger after a failed run's processes exited.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// What an execution produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    /// Every step exited 0 and the output stream was well formed.
    pub success: bool,
    /// Statistics from the end of the stream; empty on failure.
    pub stats: Map<String, Value>,
    /// Failing step name followed by its error lines.
    pub error_log: Vec<String>,
}

impl ExecutionOutcome {
    /// A failure with the given log.
    pub fn failed(error_log: Vec<String>) -> Self {
        Self {
            success: false,
            stats: Map::new(),
            error_log,
        }
    }

    /// The pipeline was busy and nothing ran.
    pub fn already_running() -> Self {
        Self::failed(vec!["Already Running".to_string()])
    }

    /// The status store refused to start the execution.
    pub fn start_rejected() -> Self {
        Self::failed(vec!["Execution start rejected".to_string()])
    }

    /// Succeeded without any step reporting errors.
    pub fn is_clean(&self) -> bool {
        self.success && self.error_log.is_empty()
    }
}

/// Runs a queued execution of `spec` and records its outcome.
///
/// Only status store failures are returned as errors; everything that goes
/// wrong inside the chain ends up in the outcome.
pub async fn execute(
    orchestrator: &Orchestrator,
    spec: &PipelineSpec,
    execution_id: &str,
    trigger: Trigger,
    use_cache: bool,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome> {
    let pipeline_id = spec.pipeline_id.as_str();
    let mut status = orchestrator.status().get(pipeline_id)?;
    if !status.start_execution(execution_id)? {
        tracing::warn!(pipeline_id, execution_id, "Execution start rejected");
        return Ok(ExecutionOutcome::start_rejected());
    }

    let timer = SpanTimer::start(pipeline_id);
    tracing::info!(pipeline_id, execution_id, %trigger, use_cache, "Executing pipeline");

    let (steps, feed) = plan(spec, use_cache);
    let report = run_chain(orchestrator, spec, &steps, feed, &mut status, execution_id, cancel).await;

    if let Err(e) = status.update_execution(execution_id, &report.log, true) {
        tracing::warn!(pipeline_id, execution_id, error = %e, "Cannot store final progress log");
    }
    let outcome = report.outcome;
    let recorded = status.finish_execution(
        execution_id,
        outcome.success,
        outcome.stats.clone(),
        outcome.error_log.clone(),
    )?;
    if !recorded {
        tracing::warn!(pipeline_id, execution_id, "Outcome not recorded, execution was superseded");
    }

    tracing::info!(
        pipeline_id,
        execution_id,
        success = outcome.success,
        rows = report.rows,
        duration_ms = timer.finish(),
        "Pipeline finished"
    );
    Ok(outcome)
}

/// Steps left to run and what feeds the first of them.
fn plan(spec: &PipelineSpec, use_cache: bool) -> (Vec<ChainStep>, Feed) {
    let cached = if use_cache {
        cache::find_cache(&spec.steps, &spec.path)
    } else {
        None
    };
    let (start, feed) = match cached {
        Some((index, path)) => {
            tracing::info!(
                pipeline_id = %spec.pipeline_id,
                step = %spec.steps[index].run,
                "Resuming from cached output"
            );
            (index + 1, Feed::Cache(path))
        }
        None => (0, Feed::Initial),
    };

    let steps = spec
        .steps
        .iter()
        .enumerate()
        .skip(start)
        .map(|(index, step)| ChainStep {
            index,
            name: step.run.clone(),
            executable: step.executable.clone(),
            parameters: Value::Object(step.parameters.clone()).to_string(),
            runner: step.runner.clone(),
            cache_to: step.cache.then(|| step.cache_hash.clone()),
        })
        .collect();
    (steps, feed)
}

struct ChainReport {
    outcome: ExecutionOutcome,
    log: Vec<String>,
    rows: u64,
}

async fn run_chain(
    orchestrator: &Orchestrator,
    spec: &PipelineSpec,
    steps: &[ChainStep],
    feed: Feed,
    status: &mut PipelineStatus,
    execution_id: &str,
    cancel: &CancellationToken,
) -> ChainReport {
    let settings = orchestrator.settings();
    let log = Arc::new(RollingLog::new(settings.error_log_limit));
    let first_error = FirstError::default();
    let ctx = ChainContext {
        cwd: &spec.path,
        runners: orchestrator.runners(),
        log: Arc::clone(&log),
        first_error: first_error.clone(),
        error_limit: settings.error_log_limit,
    };

    let Chain {
        processes,
        transfers,
        collectors,
        output,
    } = match chain::spawn(steps, feed, &ctx) {
        Ok(chain) => chain,
        Err(e) => {
            tracing::warn!(pipeline_id = %spec.pipeline_id, step = %e.step, error = %e.message, "Cannot start chain");
            return ChainReport {
                outcome: ExecutionOutcome::failed(vec![e.step, e.message]),
                log: log.snapshot(),
                rows: 0,
            };
        }
    };

    let rows = Arc::new(AtomicU64::new(0));
    let (stats_tx, stats_rx) = oneshot::channel();
    let sink = tokio::spawn(wire::drain(output, Arc::clone(&rows), stats_tx));
    let transfers: Vec<JoinHandle<Transfer>> = transfers.into_iter().map(tokio::spawn).collect();
    let collectors: Vec<JoinHandle<StepLog>> = collectors.into_iter().map(tokio::spawn).collect();

    let mut progress = Progress {
        status,
        execution_id,
        log: &log,
        rows: &rows,
    };
    let supervision = supervise(processes, &mut progress, settings.progress_interval(), cancel).await;

    let deadline = (!supervision.success).then(|| Instant::now() + DRAIN_GRACE);
    let step_logs: Vec<StepLog> = settle(collectors, deadline).await.into_iter().flatten().collect();
    let transfers = settle(transfers, deadline).await;
    let sink = settle(vec![sink], deadline).await.pop().flatten();

    for transfer in transfers.into_iter().flatten() {
        let Transfer::Teed {
            position,
            pending: Some(pending),
        } = transfer
        else {
            continue;
        };
        if supervision.cancelled || !supervision.clean.contains(&position) {
            tracing::debug!(target_file = %pending.target().display(), "Discarding cache");
            continue;
        }
        match pending.commit() {
            Ok(path) => tracing::debug!(path = %path.display(), "Cache written"),
            Err(e) => tracing::warn!(error = %e, "Cannot commit cache"),
        }
    }

    let sink_error = match sink {
        Some(Ok(_)) => None,
        Some(Err(e)) => Some(e.to_string()),
        None => Some("output stream was not drained".to_string()),
    };
    let success = supervision.success && sink_error.is_none();
    let step_report = |position: Option<usize>| {
        position
            .and_then(|p| step_logs.iter().find(|l| l.position == p))
            .map(StepLog::report)
    };

    let error_log = if supervision.cancelled {
        let mut lines = vec!["Cancelled".to_string()];
        lines.extend(cancel.reason());
        lines
    } else if success {
        step_report(first_error.get()).unwrap_or_default()
    } else if supervision.success {
        vec![SINK.to_string(), sink_error.unwrap_or_default()]
    } else {
        let failed = first_error
            .get()
            .or(supervision.first_positive_exit)
            .or(supervision.first_unsuccessful);
        let mut lines = step_report(failed).unwrap_or_default();
        lines.extend(supervision.abort_reason);
        if lines.is_empty() {
            lines.push("Pipeline failed".to_string());
        }
        lines
    };

    let stats = if success {
        stats_rx.await.unwrap_or_default()
    } else {
        Map::new()
    };

    ChainReport {
        outcome: ExecutionOutcome {
            success,
            stats,
            error_log,
        },
        log: progress.lines(),
        rows: rows.load(Ordering::Relaxed),
    }
}

/// Progress reporting hooks for the supervisor.
struct Progress<'a> {
    status: &'a mut PipelineStatus,
    execution_id: &'a str,
    log: &'a RollingLog,
    rows: &'a AtomicU64,
}

impl Progress<'_> {
    fn lines(&self) -> Vec<String> {
        let mut lines = self.log.snapshot();
        lines.push(format!("{SINK}: processed {} rows", self.rows.load(Ordering::Relaxed)));
        lines
    }

    /// Stores the progress log; `Err` when the execution is no longer current.
    fn flush(&mut self) -> std::result::Result<(), String> {
        let lines = self.lines();
        match self.status.update_execution(self.execution_id, &lines, false) {
            Ok(true) => Ok(()),
            Ok(false) => Err("Execution is no longer current".to_string()),
            Err(e) => {
                tracing::warn!(execution_id = self.execution_id, error = %e, "Cannot store progress");
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct Supervision {
    success: bool,
    cancelled: bool,
    first_positive_exit: Option<usize>,
    first_unsuccessful: Option<usize>,
    clean: Vec<usize>,
    abort_reason: Option<String>,
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            success: true,
            cancelled: false,
            first_positive_exit: None,
            first_unsuccessful: None,
            clean: Vec::new(),
            abort_reason: None,
        }
    }
}

impl Supervision {
    fn fail(&mut self, kill: &watch::Sender<bool>) {
        self.success = false;
        kill.send_replace(true);
    }

    fn record(&mut self, exit: Exit, kill: &watch::Sender<bool>) {
        match exit.status {
            Ok(status) if status.success() => self.clean.push(exit.position),
            Ok(status) => {
                if self.success {
                    tracing::warn!(step = %exit.name, code = ?status.code(), "Step failed, killing the chain");
                }
                if status.code().is_some_and(|code| code > 0) {
                    self.first_positive_exit.get_or_insert(exit.position);
                }
                self.first_unsuccessful.get_or_insert(exit.position);
                self.fail(kill);
            }
            Err(e) => {
                tracing::warn!(step = %exit.name, error = %e, "Cannot wait for step");
                self.first_unsuccessful.get_or_insert(exit.position);
                self.fail(kill);
            }
        }
    }
}

struct Exit {
    position: usize,
    name: String,
    status: io::Result<ExitStatus>,
}

/// Completes once `kill` turns true; never if the sender is gone.
async fn killed(kill: &mut watch::Receiver<bool>) {
    let signalled = kill.wait_for(|k| *k).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

async fn wait_for_exit(spawned: Spawned, mut kill: watch::Receiver<bool>) -> Exit {
    let Spawned {
        position,
        name,
        mut child,
    } = spawned;
    let status = tokio::select! {
        status = child.wait() => status,
        () = killed(&mut kill) => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(step = %name, error = %e, "Step already gone");
            }
            child.wait().await
        }
    };
    Exit {
        position,
        name,
        status,
    }
}

async fn supervise(
    processes: Vec<Spawned>,
    progress: &mut Progress<'_>,
    interval: Duration,
    cancel: &CancellationToken,
) -> Supervision {
    let (kill_tx, kill_rx) = watch::channel(false);
    let mut waiters: FuturesUnordered<_> = processes
        .into_iter()
        .map(|spawned| wait_for_exit(spawned, kill_rx.clone()))
        .collect();
    drop(kill_rx);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    let mut supervision = Supervision::default();
    loop {
        tokio::select! {
            exit = waiters.next() => match exit {
                Some(exit) => supervision.record(exit, &kill_tx),
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(reason) = progress.flush() {
                    tracing::warn!(execution_id = progress.execution_id, %reason, "Stopping chain");
                    supervision.abort_reason.get_or_insert(reason);
                    supervision.fail(&kill_tx);
                }
            }
            () = cancel.cancelled(), if !supervision.cancelled => {
                tracing::warn!(execution_id = progress.execution_id, "Cancelling chain");
                supervision.cancelled = true;
                supervision.fail(&kill_tx);
            }
        }
    }
    supervision
}

/// Joins stream tasks, giving up on those still running at `deadline`.
async fn settle<T>(handles: Vec<JoinHandle<T>>, deadline: Option<Instant>) -> Vec<Option<T>> {
    let mut results = Vec::with_capacity(handles.len());
    for mut handle in handles {
        let joined = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!("Stream still open after the chain stopped, abandoning it");
                    handle.abort();
                    results.push(None);
                    continue;
                }
            },
            None => handle.await,
        };
        match joined {
            Ok(value) => results.push(Some(value)),
            Err(e) => {
                tracing::warn!(error = %e, "Stream task failed");
                results.push(None);
            }
        }
    }
    results
}
