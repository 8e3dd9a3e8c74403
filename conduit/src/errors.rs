//! Error types for the conduit orchestrator.
//!
//! Three kinds of failure exist and they are kept apart:
//!
//! - [`SpecError`] values describe why a pipeline definition cannot run. They
//!   are data attached to a spec, never raised.
//! - [`StoreError`] covers the shared status backend.
//! - [`ConduitError`] is the crate-level error returned from fallible
//!   operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ConduitError>;

/// The main error type for conduit operations.
#[derive(Debug, Error)]
pub enum ConduitError {
    /// The status backend failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A configuration value could not be used.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A runner named by a step is not registered.
    #[error("Unknown runner: {0}")]
    UnknownRunner(String),

    /// A job could not be handed to the executor.
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a status backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("status store io error: {0}")]
    Io(#[from] std::io::Error),

    /// A value could not be encoded or decoded.
    #[error("status store encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// The redis server rejected a command or was unreachable.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored record exists but does not have the expected shape.
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt {
        /// Key of the unreadable record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// A validation problem recorded on a pipeline spec.
///
/// `short` is a stable category ("Unresolved processor", "Dirty dependency",
/// ...) and `long` the human readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecError {
    /// Error category.
    pub short: String,
    /// Detailed message.
    pub long: String,
}

impl SpecError {
    /// Creates a new spec error.
    #[must_use]
    pub fn new(short: impl Into<String>, long: impl Into<String>) -> Self {
        Self {
            short: short.into(),
            long: long.into(),
        }
    }

    /// Definition file could not be parsed at all.
    #[must_use]
    pub fn invalid_spec_file(long: impl Into<String>) -> Self {
        Self::new("Invalid Pipeline Spec", long)
    }

    /// Details failed schema validation.
    #[must_use]
    pub fn invalid_pipeline(long: impl Into<String>) -> Self {
        Self::new("Invalid Pipeline", long)
    }

    /// A step's executable could not be found.
    #[must_use]
    pub fn unresolved_processor(run: &str, path: &str) -> Self {
        Self::new(
            "Unresolved processor",
            format!("Couldn't resolve {run} at {path}"),
        )
    }

    /// A dependency could not be satisfied.
    #[must_use]
    pub fn missing_dependency(long: impl Into<String>) -> Self {
        Self::new("Missing dependency", long)
    }

    /// Returns true if this error carries the given category.
    #[must_use]
    pub fn is(&self, short: &str) -> bool {
        self.short == short
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.short, self.long)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_error_display() {
        let err = SpecError::unresolved_processor("filter", "./p");
        assert_eq!(
            err.to_string(),
            "Unresolved processor: Couldn't resolve filter at ./p"
        );
        assert!(err.is("Unresolved processor"));
    }

    #[test]
    fn test_spec_error_serialization() {
        let err = SpecError::missing_dependency("Failed to find a pipeline dependency");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["short"], "Missing dependency");

        let back: SpecError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_store_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: ConduitError = StoreError::from(io).into();
        assert!(err.to_string().contains("disk gone"));
    }
}
