//! # Conduit
//!
//! Discovery, status tracking and process-chain execution for declarative
//! data pipelines.
//!
//! Pipelines are described in `pipeline-spec.yaml` files as ordered lists of
//! steps. Conduit provides:
//!
//! - **Discovery and hashing**: resolve each step to an executable and chain
//!   a content hash through the steps and dependencies, so a pipeline is
//!   dirty exactly when something it depends on changed
//! - **Status tracking**: a persisted, bounded execution history per
//!   pipeline with guarded `queued → started → finished` transitions
//! - **Execution**: every step runs as its own OS process, wired stdout to
//!   stdin, with cached intermediate outputs and live progress
//! - **Scheduling**: dependents are re-queued when the pipelines they
//!   depend on complete
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conduit::prelude::*;
//! use std::sync::Arc;
//!
//! let orchestrator = Arc::new(Orchestrator::new(Settings::from_env()?)?);
//! let results = run_pipelines(
//!     orchestrator,
//!     &PipelineSelector::parse("all"),
//!     RunOptions::default(),
//!     Arc::new(CancellationToken::new()),
//! )
//! .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod observability;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod specs;
pub mod status;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::Settings;
    pub use crate::engine::{execute, ExecutionOutcome, RunnerRegistry, StepRunner};
    pub use crate::errors::{ConduitError, Result, SpecError, StoreError};
    pub use crate::manager::{
        run_pipelines, ExecutionResult, PipelineSelector, ResultKind, RunOptions,
    };
    pub use crate::orchestrator::Orchestrator;
    pub use crate::scheduler::{
        DependencyScheduler, Dispatcher, ExecutionJob, ReconcileAction, ReconcileReport,
        WorkerPool,
    };
    pub use crate::specs::{DiscoveryOptions, PipelineSpec, SpecOutcome};
    pub use crate::status::{PipelineExecution, PipelineState, PipelineStatus, StatusStore, Trigger};
    pub use crate::utils::{generate_execution_id, iso_timestamp, Timestamp};
}
