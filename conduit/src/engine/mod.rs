//! Process-chain execution.
//!
//! Each step of a pipeline runs as its own OS process. Step *i*'s stdout is
//! step *i+1*'s stdin, the first step reads the empty package (or a cache
//! replay) and an in-process sink drains the last stdout.

pub mod cache;
pub mod chain;
pub mod executor;
pub mod log;
pub mod runners;
pub mod wire;

#[cfg(all(test, unix))]
mod integration_tests;

pub use executor::{execute, ExecutionOutcome, SINK};
pub use runners::{Invocation, LocalRunner, RunnerRegistry, StepRunner, WrappedRunner};
pub use wire::{WireError, WireParser, WireSummary, INITIAL_PACKAGE};
