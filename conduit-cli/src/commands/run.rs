use std::process::ExitCode;

use anyhow::{Context, Result};
use conduit::manager::{run_pipelines, ExecutionResult, PipelineSelector, ResultKind, RunOptions};

/// Execute the `run` command. Exits 0 only if every pipeline succeeded
/// without reporting errors.
pub async fn execute(
    target: &str,
    use_cache: bool,
    force: bool,
    concurrency: usize,
) -> Result<ExitCode> {
    let orchestrator = super::orchestrator()?;
    let cancel = super::cancel_on_ctrl_c();
    let selector = PipelineSelector::parse(target);
    let options = RunOptions {
        use_cache,
        force,
        concurrency,
    };

    let results = run_pipelines(orchestrator, &selector, options, cancel)
        .await
        .with_context(|| format!("Failed to run {selector}"))?;

    if results.is_empty() {
        println!("Nothing to run for '{selector}'.");
        return Ok(ExitCode::SUCCESS);
    }
    for result in &results {
        print_result(result);
    }

    let clean = results.iter().filter(|r| r.is_clean()).count();
    println!("{clean}/{} pipelines succeeded.", results.len());
    if clean == results.len() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_result(result: &ExecutionResult) {
    let label = match (result.kind, result.success) {
        (ResultKind::Invalid, _) => "INVALID",
        (ResultKind::AlreadyRunning, _) => "BUSY",
        (ResultKind::Completed, true) => "SUCCESS",
        (ResultKind::Completed, false) => "FAILURE",
    };
    let stats = if result.stats.is_empty() {
        String::new()
    } else {
        format!(" {}", serde_json::Value::Object(result.stats.clone()))
    };
    println!("{label:<8} {}{stats}", result.pipeline_id);
    for line in &result.errors {
        println!("    {line}");
    }
}
