//! Deciding when pipelines run and running them.
//!
//! [`DependencyGraph`] keeps the persisted edges, [`DependencyScheduler`]
//! turns discovery results and completions into queued executions, and a
//! [`Dispatcher`] (normally the [`WorkerPool`]) runs them.

pub mod dispatch;
pub mod graph;
pub mod pool;
pub mod reconcile;

#[cfg(all(test, unix))]
mod integration_tests;

pub use dispatch::{Dispatcher, ExecutionJob};
pub use graph::DependencyGraph;
pub use pool::{PoolMetrics, WorkerPool};
pub use reconcile::{DependencyScheduler, ReconcileAction, ReconcileReport};
