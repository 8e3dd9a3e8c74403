//! Content-addressed hashing of pipelines.
//!
//! Every step hash folds in the previous hash, the step executable's bytes
//! and the step definition, so changing any step changes every hash after
//! it. The chain is seeded with the hashes of the pipeline's dependencies.

use super::model::{DependencyDef, PipelineDetails, Step};
use super::parser::RawSpec;
use crate::errors::SpecError;
use crate::status::StatusStore;
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Serializes `value` with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    // Sorted insertion keeps the order stable under serde_json's
    // preserve_order feature too.
    sorted(value).to_string()
}

/// `md5_hex(previous || executable || step_json)`.
#[must_use]
pub fn hash_step(previous: &str, executable: &[u8], step_json: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(previous.as_bytes());
    hasher.update(executable);
    hasher.update(step_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reads descriptors of external artifacts named by `datapackage`
/// dependencies.
#[cfg_attr(test, mockall::automock)]
pub trait ArtifactSource: Send + Sync {
    /// Descriptor of `reference`, resolved against the pipeline directory.
    fn descriptor(&self, reference: &str, base: &Path) -> io::Result<Value>;
}

/// Reads descriptors from the local filesystem.
///
/// A reference naming a directory reads its `datapackage.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalArtifacts;

impl ArtifactSource for LocalArtifacts {
    fn descriptor(&self, reference: &str, base: &Path) -> io::Result<Value> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "remote descriptors are not supported",
            ));
        }
        let mut path = base.join(reference);
        if path.is_dir() {
            path.push("datapackage.json");
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// What later specs need to know about an already resolved one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolEntry {
    pub cache_hash: String,
    pub dirty: bool,
    pub errors: Vec<SpecError>,
}

/// A dependency is not resolved yet in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deferred;

/// Hashes specs in discovery order, tracking every id seen so far.
pub(crate) struct HashCalculator<'a> {
    status: &'a StatusStore,
    artifacts: &'a dyn ArtifactSource,
    ignore_missing_deps: bool,
    pool: HashMap<String, PoolEntry>,
}

impl<'a> HashCalculator<'a> {
    pub fn new(
        status: &'a StatusStore,
        artifacts: &'a dyn ArtifactSource,
        ignore_missing_deps: bool,
    ) -> Self {
        Self {
            status,
            artifacts,
            ignore_missing_deps,
            pool: HashMap::new(),
        }
    }

    pub fn contains(&self, pipeline_id: &str) -> bool {
        self.pool.contains_key(pipeline_id)
    }

    pub fn register(&mut self, pipeline_id: &str, entry: PoolEntry) {
        self.pool.insert(pipeline_id.to_string(), entry);
    }

    /// Resolves the dependency seed, pushing dependency errors to `errors`.
    pub fn dependency_seed(
        &self,
        raw: &RawSpec,
        details: &PipelineDetails,
        errors: &mut Vec<SpecError>,
    ) -> Result<String, Deferred> {
        if self.ignore_missing_deps {
            return Ok(String::new());
        }

        let unresolved = details.dependencies.iter().any(|dep| {
            matches!(dep, DependencyDef::Pipeline { pipeline } if !self.pool.contains_key(pipeline))
        });
        if unresolved {
            return Err(Deferred);
        }

        let mut seed = String::new();
        for dep in &details.dependencies {
            match dep {
                DependencyDef::Pipeline { pipeline } => {
                    if let Some(hash) = self.pipeline_dependency(pipeline, errors) {
                        seed.push_str(&hash);
                    }
                }
                DependencyDef::Artifact { datapackage } => {
                    match self.artifacts.descriptor(datapackage, &raw.path) {
                        Ok(descriptor) => match descriptor.get("hash").and_then(Value::as_str) {
                            Some(hash) => seed.push_str(hash),
                            None => errors.push(SpecError::missing_dependency(format!(
                                "Couldn't get data from datapackage {datapackage}"
                            ))),
                        },
                        Err(e) => errors.push(SpecError::missing_dependency(format!(
                            "Couldn't open datapackage {datapackage}: {e}"
                        ))),
                    }
                }
                DependencyDef::Unknown(_) => {
                    errors.push(SpecError::missing_dependency("Unknown dependency provided"));
                }
            }
        }
        Ok(seed)
    }

    fn pipeline_dependency(&self, dep: &str, errors: &mut Vec<SpecError>) -> Option<String> {
        let entry = self.pool.get(dep)?;
        if !entry.errors.is_empty() {
            errors.push(SpecError::new(
                "Dependency unsuccessful",
                format!("Cannot run until dependency \"{dep}\" is fixed"),
            ));
            errors.extend(
                entry
                    .errors
                    .iter()
                    .map(|e| SpecError::new(format!("From {dep}"), e.to_string())),
            );
            return None;
        }
        if entry.dirty {
            errors.push(SpecError::new(
                "Dirty dependency",
                format!("Cannot run until dependency is executed: {dep}"),
            ));
            return None;
        }

        let succeeded = self
            .status
            .get(dep)
            .and_then(|status| status.last_execution())
            .map(|last| last.and_then(|e| e.success) == Some(true))
            .unwrap_or_else(|e| {
                tracing::warn!(dependency = dep, error = %e, "Could not read dependency status");
                false
            });
        if !succeeded {
            errors.push(SpecError::new(
                "Dependency unsuccessful",
                format!("Cannot run until dependency \"{dep}\" is successfully executed"),
            ));
            return None;
        }
        Some(entry.cache_hash.clone())
    }

    /// Hashes `details.pipeline` against resolved executables.
    pub fn hash_steps(
        seed: &str,
        details: &PipelineDetails,
        executables: &[PathBuf],
    ) -> Result<Vec<Step>, SpecError> {
        let mut previous = seed.to_string();
        let mut steps = Vec::with_capacity(details.pipeline.len());
        for (def, executable) in details.pipeline.iter().zip(executables) {
            let bytes = fs::read(executable).map_err(|e| {
                SpecError::new(
                    "Unreadable processor",
                    format!("Couldn't read {}: {e}", executable.display()),
                )
            })?;
            let step_json = serde_json::to_value(def)
                .map(|v| canonical_json(&v))
                .map_err(|e| SpecError::invalid_pipeline(e.to_string()))?;
            let cache_hash = hash_step(&previous, &bytes, &step_json);
            steps.push(Step {
                run: def.run.clone(),
                executable: executable.clone(),
                parameters: def.parameters.clone(),
                cache: def.cache,
                runner: def.runner.clone(),
                cache_hash: cache_hash.clone(),
            });
            previous = cache_hash;
        }
        Ok(steps)
    }
}
