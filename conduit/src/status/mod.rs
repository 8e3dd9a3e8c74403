//! Persisted pipeline status and execution history.
//!
//! A [`StatusStore`] hands out [`PipelineStatus`] handles bound to a
//! pluggable [`StatusBackend`]. Each status keeps a bounded, most-recent-first
//! list of [`PipelineExecution`] records and drives their lifecycle
//! (`queued → started → finished`).

pub mod backend;
pub mod execution;
pub mod filesystem;
pub mod hooks;
pub mod memory;
pub mod pipeline_status;
pub mod redis_backend;
pub mod store;

pub use backend::{StatusBackend, StoreResult, ALL_PIPELINES_KEY};
pub use execution::{PipelineExecution, Trigger};
pub use filesystem::FilesystemBackend;
pub use hooks::{HookEvent, HookPayload, HookSender};
pub use memory::InMemoryBackend;
pub use pipeline_status::{PipelineState, PipelineStatus, StatusLimits, StatusRecord};
pub use redis_backend::RedisBackend;
pub use store::StatusStore;
