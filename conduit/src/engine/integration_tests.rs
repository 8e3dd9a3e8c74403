//! End-to-end chain runs against real `/bin/sh` steps.

use super::*;
use crate::cancellation::CancellationToken;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::specs::{DiscoveryOptions, PipelineSpec};
use crate::errors::StoreError;
use crate::status::{
    InMemoryBackend, PipelineExecution, StatusBackend, StatusStore, StoreResult, Trigger,
};
use crate::testing::{
    PipelineTree, DROP_SECOND_ROW, EMIT_ROWS, FAIL_WITH_ERROR, HANG, PASS_THROUGH,
};
use crate::utils::generate_execution_id;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    tree: PipelineTree,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()))
    }

    fn with_backend(backend: Arc<dyn StatusBackend>) -> Self {
        let tree = PipelineTree::new();
        let settings = Settings::default()
            .with_root_dir(tree.root())
            .with_progress_interval_ms(50);
        let status = StatusStore::with_backend(backend, &settings);
        let orchestrator = Orchestrator::with_status(settings, status).unwrap();
        Self { tree, orchestrator }
    }

    fn spec(&self, pipeline_id: &str) -> PipelineSpec {
        self.orchestrator
            .discover(DiscoveryOptions::default())
            .find(|outcome| outcome.pipeline_id() == pipeline_id)
            .and_then(|outcome| outcome.as_valid().cloned())
            .expect("valid spec")
    }

    fn queue(&self, spec: &PipelineSpec) -> String {
        let mut status = self.orchestrator.status().get(&spec.pipeline_id).unwrap();
        status.init(
            spec.raw_details.clone(),
            spec.source_details.clone(),
            vec![],
            spec.cache_hash.clone(),
        );
        status.save().unwrap();
        let execution_id = generate_execution_id();
        assert!(status.queue_execution(&execution_id, Trigger::Manual).unwrap());
        execution_id
    }

    async fn run_with(
        &self,
        pipeline_id: &str,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> (ExecutionOutcome, PipelineExecution) {
        let spec = self.spec(pipeline_id);
        let execution_id = self.queue(&spec);
        let outcome = execute(
            &self.orchestrator,
            &spec,
            &execution_id,
            Trigger::Manual,
            use_cache,
            cancel,
        )
        .await
        .unwrap();
        let record = self
            .orchestrator
            .status()
            .get(pipeline_id)
            .unwrap()
            .last_execution()
            .unwrap()
            .unwrap();
        assert_eq!(record.execution_id, execution_id);
        (outcome, record)
    }

    async fn run(&self, pipeline_id: &str, use_cache: bool) -> (ExecutionOutcome, PipelineExecution) {
        self.run_with(pipeline_id, use_cache, &CancellationToken::new()).await
    }
}

/// Refuses every progress write: unfinished executions carrying a log.
struct NoProgressBackend(InMemoryBackend);

impl StatusBackend for NoProgressBackend {
    fn kind(&self) -> &'static str {
        "no-progress"
    }

    fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        self.0.get(key)
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let progress = key.starts_with("PipelineExecution:")
            && value["finish_time"].is_null()
            && value["log"].as_str().is_some_and(|log| !log.is_empty());
        if progress {
            return Err(StoreError::Io(std::io::Error::other("store unavailable")));
        }
        self.0.set(key, value)
    }

    fn del(&self, key: &str) -> StoreResult<()> {
        self.0.del(key)
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.0.set_add(key, member)
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.0.set_remove(key, member)
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.0.set_members(key)
    }

    fn reset(&self) -> StoreResult<()> {
        self.0.reset()
    }
}

#[tokio::test]
async fn test_outcome_is_recorded_when_progress_cannot_be_stored() {
    let h = Harness::with_backend(Arc::new(NoProgressBackend(InMemoryBackend::new())));
    h.tree.step("", "emit.sh", EMIT_ROWS);
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: emit\n");

    let (outcome, record) = h.run("./p", false).await;

    assert!(outcome.success, "{outcome:?}");
    assert!(record.is_finished());
    assert_eq!(record.success, Some(true));
}

#[tokio::test]
async fn test_filtered_rows_arrive_in_order() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", EMIT_ROWS);
    h.tree.step("", "drop.sh", DROP_SECOND_ROW);
    h.tree.step("", "capture.sh", "tee captured.out");
    h.tree.pipelines(
        "",
        "p:\n  pipeline:\n    - run: emit\n    - run: drop\n    - run: capture\n",
    );

    let (outcome, record) = h.run("./p", false).await;

    assert!(outcome.is_clean(), "{outcome:?}");
    assert_eq!(outcome.stats.get("emitted"), Some(&json!(3)));
    let captured = fs::read_to_string(h.tree.root().join("captured.out")).unwrap();
    let rows: Vec<&str> = captured.lines().filter(|l| l.starts_with("{\"v\"")).collect();
    assert_eq!(rows, vec![r#"{"v":1}"#, r#"{"v":3}"#]);

    assert_eq!(record.success, Some(true));
    assert!(record.is_finished());
    assert!(record.log.ends_with("(sink): processed 2 rows"));
}

#[tokio::test]
async fn test_failing_middle_step_kills_the_chain() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", &format!("{EMIT_ROWS}{HANG}"));
    h.tree.step("", "fail.sh", FAIL_WITH_ERROR);
    h.tree.step("", "wait.sh", HANG);
    h.tree.pipelines(
        "",
        "p:\n  pipeline:\n    - run: emit\n    - run: fail\n    - run: wait\n",
    );

    let started = Instant::now();
    let (outcome, record) = h.run("./p", false).await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(!outcome.success);
    assert!(outcome.stats.is_empty());
    assert_eq!(
        outcome.error_log,
        vec!["fail", "ERROR something broke", "  detail line"]
    );
    assert_eq!(record.success, Some(false));
    assert!(record.is_finished());
    assert!(!record.error_log.is_empty());
}

#[tokio::test]
async fn test_exit_code_without_marker_reports_tail() {
    let h = Harness::new();
    h.tree.step("", "quiet.sh", "cat > /dev/null\necho 'something odd' >&2\nexit 4");
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: quiet\n");

    let (outcome, _) = h.run("./p", false).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_log, vec!["quiet", "something odd"]);
}

#[tokio::test]
async fn test_malformed_output_fails_in_the_sink() {
    let h = Harness::new();
    h.tree.step("", "garbage.sh", "cat > /dev/null\necho 'not a package'");
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: garbage\n");

    let (outcome, _) = h.run("./p", false).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_log[0], SINK);
    assert!(outcome.error_log[1].contains("package descriptor"));
}

#[tokio::test]
async fn test_error_markers_on_success_are_reported() {
    let h = Harness::new();
    h.tree.step("", "noisy.sh", &format!("echo 'ERROR recovered' >&2\n{PASS_THROUGH}"));
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: noisy\n");

    let (outcome, _) = h.run("./p", false).await;

    assert!(outcome.success);
    assert!(!outcome.is_clean());
    assert_eq!(outcome.error_log, vec!["noisy", "ERROR recovered"]);
}

#[tokio::test]
async fn test_second_run_resumes_from_cache() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", &format!("echo run >> emit.count\n{EMIT_ROWS}"));
    h.tree.step("", "pass.sh", PASS_THROUGH);
    h.tree.pipelines(
        "",
        "p:\n  pipeline:\n    - run: emit\n      cache: true\n    - run: pass\n",
    );

    let (first, _) = h.run("./p", true).await;
    assert!(first.is_clean(), "{first:?}");
    let spec = h.spec("./p");
    assert!(cache::cache_path(&spec.path, &spec.steps[0].cache_hash).is_file());

    let (second, record) = h.run("./p", true).await;
    assert!(second.is_clean(), "{second:?}");
    assert_eq!(second.stats, first.stats);
    assert_eq!(record.success, Some(true));

    let runs = fs::read_to_string(h.tree.root().join("emit.count")).unwrap();
    assert_eq!(runs.lines().count(), 1);

    let (third, _) = h.run("./p", false).await;
    assert!(third.success);
    let runs = fs::read_to_string(h.tree.root().join("emit.count")).unwrap();
    assert_eq!(runs.lines().count(), 2);
}

#[tokio::test]
async fn test_failed_step_leaves_no_cache() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", &format!("{EMIT_ROWS}exit 1"));
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: emit\n      cache: true\n");

    let (outcome, _) = h.run("./p", true).await;

    assert!(!outcome.success);
    let spec = h.spec("./p");
    assert!(!cache::cache_path(&spec.path, &spec.steps[0].cache_hash).exists());
}

#[tokio::test]
async fn test_cancellation_kills_and_records_failure() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", EMIT_ROWS);
    h.tree.step("", "wait.sh", &format!("cat > /dev/null\n{HANG}"));
    h.tree.pipelines(
        "",
        "p:\n  pipeline:\n    - run: emit\n      cache: true\n    - run: wait\n",
    );

    let cancel = Arc::new(CancellationToken::new());
    let trigger = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel("interrupted");
        })
    };

    let started = Instant::now();
    let (outcome, record) = h.run_with("./p", true, &cancel).await;
    trigger.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcome.error_log, vec!["Cancelled", "interrupted"]);
    assert_eq!(record.success, Some(false));
    let spec = h.spec("./p");
    assert!(!cache::cache_path(&spec.path, &spec.steps[0].cache_hash).exists());
}

#[tokio::test]
async fn test_start_is_rejected_for_unknown_execution() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", EMIT_ROWS);
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: emit\n");
    let spec = h.spec("./p");
    h.queue(&spec);

    let outcome = execute(
        &h.orchestrator,
        &spec,
        "not-the-queued-one",
        Trigger::Manual,
        false,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome, ExecutionOutcome::start_rejected());
}

#[tokio::test]
async fn test_unknown_runner_fails_before_spawning() {
    let h = Harness::new();
    h.tree.step("", "emit.sh", EMIT_ROWS);
    h.tree.pipelines("", "p:\n  pipeline:\n    - run: emit\n      runner: elsewhere\n");

    let (outcome, record) = h.run("./p", false).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_log, vec!["emit", "Unknown runner: elsewhere"]);
    assert_eq!(record.success, Some(false));
}
