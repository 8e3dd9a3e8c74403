pub mod init;
pub mod run;
pub mod serve;
pub mod status;

use anyhow::{Context, Result};
use conduit::cancellation::CancellationToken;
use conduit::config::Settings;
use conduit::orchestrator::Orchestrator;
use std::sync::Arc;

/// Builds the orchestrator from `CONDUIT_*` environment variables.
fn orchestrator() -> Result<Arc<Orchestrator>> {
    let settings = Settings::from_env().context("Invalid CONDUIT_* environment")?;
    let orchestrator = Orchestrator::new(settings).context("Failed to set up orchestrator")?;
    Ok(Arc::new(orchestrator))
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> Arc<CancellationToken> {
    let cancel = Arc::new(CancellationToken::new());
    let token = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            token.cancel("Interrupted");
        }
    });
    cancel
}
