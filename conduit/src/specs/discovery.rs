//! Lazy discovery of every pipeline under the root directory.
//!
//! Files are read in a stable order, but that order is not topological: a
//! spec whose pipeline dependency has not been seen yet is set aside and
//! retried once the first pass is over. Each retry pass must shrink the
//! deferred set; when a pass makes no progress every remaining spec fails
//! with a missing-dependency error, which ends the loop.

use super::generator::GeneratorRegistry;
use super::hasher::{ArtifactSource, Deferred, HashCalculator, PoolEntry};
use super::model::{InvalidSpec, PipelineDetails, PipelineSpec, SpecOutcome};
use super::parser::{find_spec_files, parse_spec_file, RawSpec, SpecFile};
use super::resolver::ExecutableResolver;
use crate::errors::SpecError;
use crate::status::StatusStore;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

/// Discovery switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Skip dependency resolution entirely and hash with an empty seed.
    pub ignore_missing_deps: bool,
}

impl DiscoveryOptions {
    /// Options that ignore dependencies.
    #[must_use]
    pub const fn ignoring_dependencies() -> Self {
        Self {
            ignore_missing_deps: true,
        }
    }
}

enum Processed {
    Done(SpecOutcome),
    Deferred(RawSpec),
}

/// Iterator over every pipeline found under a root directory.
pub struct Discovery<'a> {
    root: PathBuf,
    resolver: &'a ExecutableResolver,
    generators: &'a GeneratorRegistry,
    status: &'a StatusStore,
    hasher: HashCalculator<'a>,
    files: VecDeque<SpecFile>,
    ready: VecDeque<RawSpec>,
    deferred: Vec<RawSpec>,
    last_deferred: Option<usize>,
}

impl<'a> Discovery<'a> {
    /// Starts a discovery pass over `root`.
    pub fn new(
        root: &Path,
        resolver: &'a ExecutableResolver,
        generators: &'a GeneratorRegistry,
        artifacts: &'a dyn ArtifactSource,
        status: &'a StatusStore,
        options: DiscoveryOptions,
    ) -> Self {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let files = find_spec_files(&root).unwrap_or_else(|e| {
            tracing::warn!(root = %root.display(), error = %e, "Cannot scan pipeline root");
            Vec::new()
        });
        Self {
            root,
            resolver,
            generators,
            status,
            hasher: HashCalculator::new(status, artifacts, options.ignore_missing_deps),
            files: files.into(),
            ready: VecDeque::new(),
            deferred: Vec::new(),
            last_deferred: None,
        }
    }

    fn process(&mut self, raw: RawSpec) -> Processed {
        let declared = declared_dependencies(&raw.details);

        if self.hasher.contains(&raw.pipeline_id) {
            let error = SpecError::new(
                "Duplicate Pipeline Id",
                format!("Duplicate key {} in {}", raw.pipeline_id, raw.path.display()),
            );
            tracing::warn!(pipeline_id = %raw.pipeline_id, "Duplicate pipeline id");
            return Processed::Done(invalid(raw, declared, vec![error]));
        }

        let mut errors = raw.errors.clone();
        if !errors.is_empty() {
            return Processed::Done(self.reject(raw, declared, errors));
        }

        let details: PipelineDetails = match serde_json::from_value(raw.details.clone()) {
            Ok(details) => details,
            Err(e) => {
                errors.push(SpecError::invalid_pipeline(e.to_string()));
                return Processed::Done(self.reject(raw, declared, errors));
            }
        };

        let mut executables = Vec::with_capacity(details.pipeline.len());
        for step in &details.pipeline {
            match self.resolver.resolve(&step.run, &raw.path) {
                Some(path) => executables.push(path),
                None => errors.push(SpecError::unresolved_processor(&step.run, &raw.pipeline_id)),
            }
        }
        if let Some(error) = details.schedule.as_ref().and_then(|s| s.validate()) {
            errors.push(error);
        }
        if !errors.is_empty() {
            return Processed::Done(self.reject(raw, declared, errors));
        }

        let seed = match self.hasher.dependency_seed(&raw, &details, &mut errors) {
            Ok(seed) => seed,
            Err(Deferred) => return Processed::Deferred(raw),
        };
        if !errors.is_empty() {
            return Processed::Done(self.reject(raw, declared, errors));
        }

        let steps = match HashCalculator::hash_steps(&seed, &details, &executables) {
            Ok(steps) => steps,
            Err(error) => return Processed::Done(self.reject(raw, declared, vec![error])),
        };
        let cache_hash = steps.last().map_or(seed, |s| s.cache_hash.clone());
        let dirty = self
            .status
            .get(&raw.pipeline_id)
            .and_then(|status| status.dirty_for(&cache_hash))
            .unwrap_or_else(|e| {
                tracing::warn!(pipeline_id = %raw.pipeline_id, error = %e, "Cannot read status, assuming dirty");
                true
            });

        self.hasher.register(
            &raw.pipeline_id,
            PoolEntry {
                cache_hash: cache_hash.clone(),
                dirty,
                errors: Vec::new(),
            },
        );
        tracing::debug!(pipeline_id = %raw.pipeline_id, cache_hash = %cache_hash, dirty, "Discovered pipeline");

        Processed::Done(SpecOutcome::Valid(PipelineSpec {
            pipeline_id: raw.pipeline_id,
            path: raw.path,
            details,
            raw_details: raw.details,
            source_details: raw.source_details,
            steps,
            dependencies: declared,
            cache_hash,
            dirty,
        }))
    }

    fn reject(&mut self, raw: RawSpec, declared: Vec<String>, errors: Vec<SpecError>) -> SpecOutcome {
        tracing::warn!(
            pipeline_id = %raw.pipeline_id,
            errors = ?errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Invalid pipeline"
        );
        self.hasher.register(
            &raw.pipeline_id,
            PoolEntry {
                cache_hash: String::new(),
                dirty: false,
                errors: errors.clone(),
            },
        );
        invalid(raw, declared, errors)
    }
}

impl Iterator for Discovery<'_> {
    type Item = SpecOutcome;

    fn next(&mut self) -> Option<SpecOutcome> {
        loop {
            if let Some(raw) = self.ready.pop_front() {
                match self.process(raw) {
                    Processed::Done(outcome) => return Some(outcome),
                    Processed::Deferred(raw) => self.deferred.push(raw),
                }
                continue;
            }

            if let Some(file) = self.files.pop_front() {
                self.ready
                    .extend(parse_spec_file(&file, &self.root, self.generators));
                continue;
            }

            if self.deferred.is_empty() {
                return None;
            }

            let pending = self.deferred.len();
            if self.last_deferred == Some(pending) {
                for raw in &mut self.deferred {
                    raw.errors.push(SpecError::missing_dependency(
                        "Failed to find a pipeline dependency",
                    ));
                }
            }
            self.last_deferred = Some(pending);
            self.ready.extend(self.deferred.drain(..));
        }
    }
}

fn invalid(raw: RawSpec, declared: Vec<String>, errors: Vec<SpecError>) -> SpecOutcome {
    SpecOutcome::Invalid(InvalidSpec {
        pipeline_id: raw.pipeline_id,
        path: raw.path,
        raw_details: raw.details,
        source_details: raw.source_details,
        dependencies: declared,
        errors,
    })
}

/// Pipeline ids named under `dependencies`, read leniently from raw details.
fn declared_dependencies(details: &Value) -> Vec<String> {
    details
        .get("dependencies")
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(|dep| dep.get("pipeline").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}
