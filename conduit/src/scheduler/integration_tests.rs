//! Reconcile passes over real pipeline trees, with a recording dispatcher
//! standing in for workers.

use super::*;
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::status::Trigger;
use crate::testing::{PipelineTree, EMIT_ROWS, PASS_THROUGH};
use pretty_assertions::assert_eq;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

const CHAIN: &str = concat!(
    "a:\n  pipeline:\n    - run: emit\n",
    "b:\n  dependencies: [{pipeline: ./a}]\n  pipeline:\n    - run: emit\n",
    "c:\n  dependencies: [{pipeline: ./b}]\n  pipeline:\n    - run: emit\n",
);

struct Harness {
    tree: PipelineTree,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<crate::testing::RecordingDispatcher>,
    scheduler: DependencyScheduler,
}

impl Harness {
    fn new(settings: Settings) -> Self {
        let tree = PipelineTree::new();
        tree.step("", "emit.sh", EMIT_ROWS);
        let orchestrator =
            Arc::new(Orchestrator::in_memory(settings.with_root_dir(tree.root())).unwrap());
        let dispatcher = Arc::new(crate::testing::RecordingDispatcher::new());
        let scheduler = DependencyScheduler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        );
        Self {
            tree,
            orchestrator,
            dispatcher,
            scheduler,
        }
    }

    async fn reconcile(&self, action: ReconcileAction) -> ReconcileReport {
        self.orchestrator.resolver().clear();
        self.scheduler.reconcile(action).await.unwrap()
    }

    /// Finishes every recorded job with `success`, in dispatch order.
    fn finish_all(&self, success: bool) -> Vec<ExecutionJob> {
        let jobs = self.dispatcher.take();
        for job in &jobs {
            let mut status = self.orchestrator.status().get(&job.spec.pipeline_id).unwrap();
            assert!(status.start_execution(&job.execution_id).unwrap());
            assert!(status
                .finish_execution(&job.execution_id, success, Map::new(), vec![])
                .unwrap());
        }
        jobs
    }

    async fn complete(&self, pipeline_id: &str, trigger: Trigger) -> ReconcileReport {
        self.reconcile(ReconcileAction::Complete {
            pipeline_id: pipeline_id.to_string(),
            trigger,
        })
        .await
    }
}

fn ids(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn test_completion_cascades_one_level_at_a_time() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", CHAIN);

    let report = h.reconcile(ReconcileAction::Update).await;
    assert_eq!(report.queued, ids(&["./a"]));
    let jobs = h.finish_all(true);
    assert_eq!(jobs[0].trigger, Trigger::DirtyTask);

    let report = h.complete("./a", Trigger::DirtyTask).await;
    assert_eq!(report.queued, ids(&["./b"]));
    let jobs = h.finish_all(true);
    assert_eq!(jobs[0].trigger, Trigger::Dependency);

    let report = h.complete("./b", Trigger::Dependency).await;
    assert_eq!(report.queued, ids(&["./c"]));
    h.finish_all(true);

    let report = h.complete("./c", Trigger::Dependency).await;
    assert!(report.queued.is_empty());
    let report = h.reconcile(ReconcileAction::Update).await;
    assert!(report.queued.is_empty(), "{report:?}");
}

#[tokio::test]
async fn test_scheduled_completion_reruns_clean_dependents() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", CHAIN);
    h.reconcile(ReconcileAction::Update).await;
    h.finish_all(true);
    h.complete("./a", Trigger::DirtyTask).await;
    h.finish_all(true);
    h.complete("./b", Trigger::Dependency).await;
    h.finish_all(true);

    // Nothing is dirty, but a scheduled run still cascades; ./c waits for ./b.
    let report = h.complete("./a", Trigger::Scheduled).await;
    assert_eq!(report.queued, ids(&["./b"]));
    assert_eq!(h.dispatcher.jobs()[0].trigger, Trigger::Scheduled);

    let report = h.complete("./a", Trigger::Dependency).await;
    assert!(report.queued.is_empty());
}

#[tokio::test]
async fn test_update_skips_pipelines_already_in_flight() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", "a:\n  pipeline:\n    - run: emit\n");

    let first = h.reconcile(ReconcileAction::Update).await;
    let second = h.reconcile(ReconcileAction::Update).await;

    assert_eq!(first.queued, ids(&["./a"]));
    assert!(second.queued.is_empty());
    assert_eq!(second.busy, ids(&["./a"]));
    assert_eq!(h.dispatcher.jobs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_queue_a_pipeline_once() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines(
        "",
        "a:\n  pipeline:\n    - run: emit\nb:\n  dependencies: [{pipeline: ./a}]\n  pipeline:\n    - run: emit\n",
    );
    h.reconcile(ReconcileAction::Update).await;
    h.finish_all(true);

    let mut passes = tokio::task::JoinSet::new();
    for i in 0..8 {
        let scheduler = h.scheduler.clone();
        let action = if i % 2 == 0 {
            ReconcileAction::Update
        } else {
            ReconcileAction::Complete {
                pipeline_id: "./a".to_string(),
                trigger: Trigger::DirtyTask,
            }
        };
        passes.spawn(async move { scheduler.reconcile(action).await.unwrap() });
    }
    while let Some(report) = passes.join_next().await {
        report.unwrap();
    }

    assert_eq!(h.dispatcher.pipeline_ids(), ids(&["./b"]));
    let job = &h.dispatcher.jobs()[0];
    let mut status = h.orchestrator.status().get("./b").unwrap();
    assert_eq!(status.execution_ids(), [job.execution_id.clone()]);
    assert!(status.start_execution(&job.execution_id).unwrap());
}

#[tokio::test]
async fn test_update_respects_batch_ceiling() {
    let h = Harness::new(Settings::default().with_batch_ceiling(2));
    h.tree.pipelines(
        "",
        "a: {pipeline: [{run: emit}]}\nb: {pipeline: [{run: emit}]}\nc: {pipeline: [{run: emit}]}\n",
    );

    let first = h.reconcile(ReconcileAction::Update).await;
    assert_eq!(first.queued, ids(&["./a", "./b"]));
    h.finish_all(true);

    let second = h.reconcile(ReconcileAction::Update).await;
    assert_eq!(second.queued, ids(&["./c"]));
}

#[tokio::test]
async fn test_failed_pipeline_is_retried_until_it_succeeds() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", "a:\n  pipeline:\n    - run: emit\n");

    h.reconcile(ReconcileAction::Update).await;
    h.finish_all(false);
    let report = h.reconcile(ReconcileAction::Update).await;
    assert_eq!(report.queued, ids(&["./a"]));

    h.finish_all(true);
    let report = h.reconcile(ReconcileAction::Update).await;
    assert!(report.queued.is_empty());
}

#[tokio::test]
async fn test_removed_pipelines_are_deregistered_once_idle() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", "a: {pipeline: [{run: emit}]}\nb: {pipeline: [{run: emit}]}\n");
    h.reconcile(ReconcileAction::Update).await;
    h.finish_all(true);

    h.tree.pipelines("", "a: {pipeline: [{run: emit}]}\n");
    let report = h.reconcile(ReconcileAction::Update).await;

    assert_eq!(report.deregistered, ids(&["./b"]));
    assert_eq!(h.orchestrator.status().all_pipeline_ids().unwrap(), ids(&["./a"]));
}

#[tokio::test]
async fn test_scheduled_action_requires_a_schedule() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines(
        "",
        concat!(
            "timed:\n  schedule: {crontab: '0 * * * *'}\n  pipeline:\n    - run: emit\n",
            "plain:\n  pipeline:\n    - run: emit\n",
        ),
    );

    let timed = h
        .reconcile(ReconcileAction::Scheduled("./timed".to_string()))
        .await;
    let plain = h
        .reconcile(ReconcileAction::Scheduled("./plain".to_string()))
        .await;

    assert_eq!(timed.queued, ids(&["./timed"]));
    assert!(plain.queued.is_empty());
    assert_eq!(h.dispatcher.jobs()[0].trigger, Trigger::Scheduled);
}

#[tokio::test]
async fn test_init_cancels_leftover_executions() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", "a:\n  pipeline:\n    - run: emit\n");
    h.reconcile(ReconcileAction::Update).await;

    let report = h.reconcile(ReconcileAction::Init).await;
    assert!(report.queued.is_empty());

    let last = h
        .orchestrator
        .status()
        .get("./a")
        .unwrap()
        .last_execution()
        .unwrap()
        .unwrap();
    assert_eq!(last.success, Some(false));
    assert_eq!(last.error_log, vec!["Cancelled"]);
}

#[tokio::test]
async fn test_refused_dispatch_finishes_the_execution() {
    let h = Harness::new(Settings::default());
    h.tree.pipelines("", "a:\n  pipeline:\n    - run: emit\n");
    h.dispatcher.refuse(true);

    let report = h.reconcile(ReconcileAction::Update).await;

    assert!(report.queued.is_empty());
    let last = h
        .orchestrator
        .status()
        .get("./a")
        .unwrap()
        .last_execution()
        .unwrap()
        .unwrap();
    assert!(last.is_finished());
    assert!(last.error_log[0].starts_with("Dispatch failed"));
}

#[tokio::test]
async fn test_worker_pool_runs_the_whole_chain() {
    let tree = PipelineTree::new();
    tree.step("", "emit.sh", EMIT_ROWS);
    tree.step("", "pass.sh", PASS_THROUGH);
    tree.pipelines(
        "",
        concat!(
            "a:\n  pipeline:\n    - run: emit\n",
            "b:\n  dependencies: [{pipeline: ./a}]\n  pipeline:\n    - run: emit\n    - run: pass\n",
        ),
    );
    let settings = Settings::default()
        .with_root_dir(tree.root())
        .with_progress_interval_ms(50);
    let orchestrator = Arc::new(Orchestrator::in_memory(settings).unwrap());
    let cancel = Arc::new(CancellationToken::new());
    let (pool, handle) = WorkerPool::start(Arc::clone(&orchestrator), 2, Arc::clone(&cancel));
    let scheduler = DependencyScheduler::new(Arc::clone(&orchestrator), Arc::new(pool.clone()));

    let report = scheduler.reconcile(ReconcileAction::Update).await.unwrap();
    assert_eq!(report.queued, ids(&["./a"]));

    let succeeded = |id: &str| {
        orchestrator
            .status()
            .get(id)
            .unwrap()
            .last_successful_execution()
            .unwrap()
            .is_some()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !(succeeded("./a") && succeeded("./b")) {
        assert!(tokio::time::Instant::now() < deadline, "chain did not finish");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel("test over");
    handle.await.unwrap();
    assert_eq!(pool.metrics().succeeded(), 2);
    assert_eq!(pool.metrics().failed(), 0);
    let b = orchestrator
        .status()
        .get("./b")
        .unwrap()
        .last_execution()
        .unwrap()
        .unwrap();
    assert_eq!(b.trigger, Trigger::Dependency);
}
