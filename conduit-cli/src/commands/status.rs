use std::process::ExitCode;

use anyhow::Result;
use conduit::specs::DiscoveryOptions;

/// Execute the `status` command: one line per discovered pipeline.
pub fn execute() -> Result<ExitCode> {
    let orchestrator = super::orchestrator()?;
    let mut count = 0;
    for outcome in orchestrator.discover(DiscoveryOptions::default()) {
        count += 1;
        let status = orchestrator.status().get(outcome.pipeline_id())?;
        let state = if outcome.is_valid() {
            status.state()?.to_string()
        } else {
            "INVALID".to_string()
        };
        let marker = if outcome.dirty() { " (dirty)" } else { "" };
        println!("{:<12} {}{marker}", state, outcome.pipeline_id());
        for error in outcome.errors() {
            println!("             {error}");
        }
    }
    if count == 0 {
        println!("No pipelines found.");
    }
    Ok(ExitCode::SUCCESS)
}
