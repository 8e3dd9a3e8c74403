//! Runtime settings.
//!
//! Every knob has a serde default so a partial YAML/JSON document
//! deserializes cleanly; [`Settings::from_env`] overlays `CONDUIT_*`
//! environment variables on top of the defaults.

use crate::errors::{ConduitError, Result};
use crate::retry::{Backoff, Jitter, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the tree scanned for pipeline definitions.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Extra directories searched for step executables, in order.
    #[serde(default)]
    pub processor_path: Vec<PathBuf>,
    /// Bundled standard-library directory, searched last.
    #[serde(default)]
    pub stdlib_dir: Option<PathBuf>,
    /// File extensions tried when resolving a step reference.
    #[serde(default = "default_step_extensions")]
    pub step_extensions: Vec<String>,
    /// Redis host; when unset the filesystem backend is used.
    #[serde(default)]
    pub redis_host: Option<String>,
    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    /// Redis logical database.
    #[serde(default = "default_redis_db")]
    pub redis_db: u32,
    /// Directory of the filesystem status backend.
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,
    /// YAML file with named step runners.
    #[serde(default = "default_runner_config")]
    pub runner_config: PathBuf,
    /// Maximum pipelines queued by one update pass.
    #[serde(default = "default_batch_ceiling")]
    pub batch_ceiling: usize,
    /// Executions kept per pipeline.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Seconds after which an unfinished execution counts as stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// How often a running execution flushes its log to the status store.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Maximum lines kept in rolling logs and per-step error lists.
    #[serde(default = "default_error_log_limit")]
    pub error_log_limit: usize,
    /// Webhook delivery retries.
    #[serde(default)]
    pub hook_retry: RetryPolicy,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_step_extensions() -> Vec<String> {
    vec!["py".to_string(), "sh".to_string()]
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_db() -> u32 {
    5
}

fn default_status_dir() -> PathBuf {
    PathBuf::from(".conduit")
}

fn default_runner_config() -> PathBuf {
    PathBuf::from("conduit-runners.yaml")
}

fn default_batch_ceiling() -> usize {
    4
}

fn default_history_limit() -> usize {
    10
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_progress_interval_ms() -> u64 {
    10_000
}

fn default_error_log_limit() -> usize {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            processor_path: Vec::new(),
            stdlib_dir: None,
            step_extensions: default_step_extensions(),
            redis_host: None,
            redis_port: default_redis_port(),
            redis_db: default_redis_db(),
            status_dir: default_status_dir(),
            runner_config: default_runner_config(),
            batch_ceiling: default_batch_ceiling(),
            history_limit: default_history_limit(),
            stale_after_secs: default_stale_after_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            error_log_limit: default_error_log_limit(),
            hook_retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Creates settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds settings from the process environment.
    ///
    /// Recognised variables:
    /// - `CONDUIT_ROOT`
    /// - `CONDUIT_PROCESSOR_PATH` (`;`-separated)
    /// - `CONDUIT_STDLIB_DIR`
    /// - `CONDUIT_REDIS_HOST`, `CONDUIT_REDIS_PORT`, `CONDUIT_REDIS_DB`
    /// - `CONDUIT_STATUS_DIR`
    /// - `CONDUIT_RUNNER_CONFIG`
    /// - `CONDUIT_BATCH_CEILING`
    /// - `CONDUIT_HOOK_ATTEMPTS`, `CONDUIT_HOOK_DELAY_MS`
    /// - `CONDUIT_HOOK_BACKOFF` (`exponential`, `linear`, `constant`)
    /// - `CONDUIT_HOOK_JITTER` (`none`, `full`, `equal`)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(root) = var("CONDUIT_ROOT") {
            settings.root_dir = PathBuf::from(root);
        }
        if let Some(path) = var("CONDUIT_PROCESSOR_PATH") {
            settings.processor_path = path
                .split(';')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(dir) = var("CONDUIT_STDLIB_DIR") {
            settings.stdlib_dir = Some(PathBuf::from(dir));
        }
        settings.redis_host = var("CONDUIT_REDIS_HOST");
        if let Some(port) = var("CONDUIT_REDIS_PORT") {
            settings.redis_port = parse_var("CONDUIT_REDIS_PORT", &port)?;
        }
        if let Some(db) = var("CONDUIT_REDIS_DB") {
            settings.redis_db = parse_var("CONDUIT_REDIS_DB", &db)?;
        }
        if let Some(dir) = var("CONDUIT_STATUS_DIR") {
            settings.status_dir = PathBuf::from(dir);
        }
        if let Some(file) = var("CONDUIT_RUNNER_CONFIG") {
            settings.runner_config = PathBuf::from(file);
        }
        if let Some(ceiling) = var("CONDUIT_BATCH_CEILING") {
            settings.batch_ceiling = parse_var("CONDUIT_BATCH_CEILING", &ceiling)?;
        }
        if let Some(attempts) = var("CONDUIT_HOOK_ATTEMPTS") {
            let attempts = parse_var("CONDUIT_HOOK_ATTEMPTS", &attempts)?;
            settings.hook_retry = settings.hook_retry.with_max_attempts(attempts);
        }
        if let Some(delay) = var("CONDUIT_HOOK_DELAY_MS") {
            let delay = parse_var("CONDUIT_HOOK_DELAY_MS", &delay)?;
            settings.hook_retry = settings.hook_retry.with_base_delay_ms(delay);
        }
        if let Some(backoff) = var("CONDUIT_HOOK_BACKOFF") {
            let backoff: Backoff = parse_var("CONDUIT_HOOK_BACKOFF", &backoff)?;
            settings.hook_retry = settings.hook_retry.with_backoff(backoff);
        }
        if let Some(jitter) = var("CONDUIT_HOOK_JITTER") {
            let jitter: Jitter = parse_var("CONDUIT_HOOK_JITTER", &jitter)?;
            settings.hook_retry = settings.hook_retry.with_jitter(jitter);
        }

        Ok(settings)
    }

    /// Sets the root directory.
    #[must_use]
    pub fn with_root_dir(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_dir = root.into();
        self
    }

    /// Sets the processor search path.
    #[must_use]
    pub fn with_processor_path(mut self, path: Vec<PathBuf>) -> Self {
        self.processor_path = path;
        self
    }

    /// Sets the standard-library directory.
    #[must_use]
    pub fn with_stdlib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.stdlib_dir = Some(dir.into());
        self
    }

    /// Sets the filesystem backend directory.
    #[must_use]
    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = dir.into();
        self
    }

    /// Sets the runner config file.
    #[must_use]
    pub fn with_runner_config(mut self, file: impl Into<PathBuf>) -> Self {
        self.runner_config = file.into();
        self
    }

    /// Sets the update-pass batch ceiling.
    #[must_use]
    pub fn with_batch_ceiling(mut self, ceiling: usize) -> Self {
        self.batch_ceiling = ceiling;
        self
    }

    /// Sets the number of executions kept per pipeline.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Sets the staleness window.
    #[must_use]
    pub fn with_stale_after_secs(mut self, secs: u64) -> Self {
        self.stale_after_secs = secs;
        self
    }

    /// Sets the progress flush interval.
    #[must_use]
    pub fn with_progress_interval_ms(mut self, ms: u64) -> Self {
        self.progress_interval_ms = ms;
        self
    }

    /// Sets the webhook retry policy.
    #[must_use]
    pub fn with_hook_retry(mut self, policy: RetryPolicy) -> Self {
        self.hook_retry = policy;
        self
    }

    /// Redis connection URL, if a host is configured.
    #[must_use]
    pub fn redis_url(&self) -> Option<String> {
        self.redis_host
            .as_ref()
            .map(|host| format!("redis://{host}:{}/{}", self.redis_port, self.redis_db))
    }

    /// Staleness window as a duration.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Progress flush interval as a duration.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Runner config path, resolved against the root directory.
    #[must_use]
    pub fn runner_config_path(&self) -> PathBuf {
        if self.runner_config.is_absolute() {
            self.runner_config.clone()
        } else {
            self.root_dir.join(&self.runner_config)
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConduitError::Config(format!("{key}={value}: {e}")))
}
