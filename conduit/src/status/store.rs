//! Entry point to the status backend.

use super::backend::{StatusBackend, StoreResult};
use super::filesystem::FilesystemBackend;
use super::hooks::HookSender;
use super::pipeline_status::{PipelineStatus, StatusLimits};
use super::redis_backend::RedisBackend;
use crate::config::Settings;
use std::sync::Arc;

/// Shared handle to pipeline statuses.
#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<dyn StatusBackend>,
    hooks: HookSender,
    limits: StatusLimits,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("backend", &self.backend.kind())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl StatusStore {
    /// Opens the backend described by `settings`.
    ///
    /// Redis is used when a host is configured and answers; otherwise the
    /// store falls back to files under `status_dir`.
    pub fn connect(settings: &Settings) -> StoreResult<Self> {
        let backend: Arc<dyn StatusBackend> = match settings.redis_url() {
            Some(url) => match RedisBackend::connect(&url) {
                Ok(redis) => {
                    tracing::info!(url = %url, "Using redis status backend");
                    Arc::new(redis)
                }
                Err(e) => {
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        "Redis unreachable, falling back to filesystem status backend"
                    );
                    Arc::new(FilesystemBackend::open(status_dir(settings))?)
                }
            },
            None => Arc::new(FilesystemBackend::open(status_dir(settings))?),
        };
        Ok(Self::with_backend(backend, settings))
    }

    /// Wraps an existing backend.
    #[must_use]
    pub fn with_backend(backend: Arc<dyn StatusBackend>, settings: &Settings) -> Self {
        Self {
            backend,
            hooks: HookSender::new(settings.hook_retry.clone()),
            limits: StatusLimits {
                history_limit: settings.history_limit,
                stale_after: settings.stale_after(),
            },
        }
    }

    /// Underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StatusBackend> {
        &self.backend
    }

    /// Status of `pipeline_id`; an empty, unsaved one if none is stored.
    pub fn get(&self, pipeline_id: &str) -> StoreResult<PipelineStatus> {
        PipelineStatus::load(
            pipeline_id,
            Arc::clone(&self.backend),
            self.hooks.clone(),
            self.limits,
        )
    }

    /// Removes a pipeline's record and its execution history.
    pub fn deregister(&self, pipeline_id: &str) -> StoreResult<()> {
        self.get(pipeline_id)?.delete()?;
        tracing::info!(pipeline_id, "Deregistered pipeline");
        Ok(())
    }

    /// Every registered pipeline id, sorted.
    pub fn all_pipeline_ids(&self) -> StoreResult<Vec<String>> {
        self.backend.all_pipeline_ids()
    }

    /// Statuses of every registered pipeline.
    pub fn all_statuses(&self) -> StoreResult<Vec<PipelineStatus>> {
        self.all_pipeline_ids()?
            .iter()
            .map(|id| self.get(id))
            .collect()
    }

    /// Drops every record.
    pub fn reset(&self) -> StoreResult<()> {
        self.backend.reset()
    }
}

fn status_dir(settings: &Settings) -> std::path::PathBuf {
    if settings.status_dir.is_absolute() {
        settings.status_dir.clone()
    } else {
        settings.root_dir.join(&settings.status_dir)
    }
}
