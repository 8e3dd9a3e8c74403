use std::process::ExitCode;

use anyhow::{Context, Result};

/// Execute the `init` command: forget every recorded status.
pub fn execute() -> Result<ExitCode> {
    let orchestrator = super::orchestrator()?;
    orchestrator
        .reset()
        .context("Failed to reset the status store")?;
    println!("Status store cleared.");
    Ok(ExitCode::SUCCESS)
}
