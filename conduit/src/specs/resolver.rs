//! Resolution of dotted step references to executables on disk.
//!
//! `run: dump.to_path` looks for `dump/to_path` (bare, then with each known
//! extension) in the pipeline directory, then along the processor search
//! path, then in the bundled standard library. A leading dot restricts the
//! search to the pipeline directory and every further dot climbs one level:
//! `..shared.clean` is `../shared/clean` relative to the pipeline.

use crate::config::Settings;
use dashmap::DashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Finds step executables and remembers what it found.
#[derive(Debug, Default)]
pub struct ExecutableResolver {
    search_path: Vec<PathBuf>,
    stdlib_dir: Option<PathBuf>,
    extensions: Vec<String>,
    found: DashMap<(PathBuf, String), PathBuf>,
}

impl ExecutableResolver {
    /// Creates a resolver with an explicit search configuration.
    #[must_use]
    pub fn new(
        search_path: Vec<PathBuf>,
        stdlib_dir: Option<PathBuf>,
        extensions: Vec<String>,
    ) -> Self {
        Self {
            search_path,
            stdlib_dir,
            extensions,
            found: DashMap::new(),
        }
    }

    /// Creates a resolver from settings.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.processor_path.clone(),
            settings.stdlib_dir.clone(),
            settings.step_extensions.clone(),
        )
    }

    /// Absolute path of the executable `reference` names, seen from
    /// `pipeline_dir`.
    #[must_use]
    pub fn resolve(&self, reference: &str, pipeline_dir: &Path) -> Option<PathBuf> {
        let cache_key = (pipeline_dir.to_path_buf(), reference.to_string());
        if let Some(hit) = self.found.get(&cache_key) {
            if hit.is_file() {
                return Some(hit.clone());
            }
        }

        let (relative, local_only) = relative_path(reference)?;
        let mut bases: Vec<&Path> = vec![pipeline_dir];
        if !local_only {
            bases.extend(self.search_path.iter().map(PathBuf::as_path));
            bases.extend(self.stdlib_dir.as_deref());
        }

        let resolved = bases
            .into_iter()
            .find_map(|base| self.probe(&base.join(&relative)))?;
        tracing::trace!(reference, path = %resolved.display(), "Resolved step executable");
        self.found.insert(cache_key, resolved.clone());
        Some(resolved)
    }

    /// Forgets every cached resolution.
    pub fn clear(&self) {
        self.found.clear();
    }

    fn probe(&self, candidate: &Path) -> Option<PathBuf> {
        if candidate.is_file() {
            return fs::canonicalize(candidate).ok();
        }
        self.extensions.iter().find_map(|ext| {
            let mut name = OsString::from(candidate.as_os_str());
            name.push(".");
            name.push(ext);
            let path = PathBuf::from(name);
            path.is_file().then(|| fs::canonicalize(&path).ok()).flatten()
        })
    }
}

/// Converts a dotted reference to a relative path and whether it is
/// pipeline-local.
fn relative_path(reference: &str) -> Option<(PathBuf, bool)> {
    let dots = reference.chars().take_while(|c| *c == '.').count();
    let rest = &reference[dots..];
    if rest.is_empty() {
        return None;
    }

    let mut path = PathBuf::new();
    for _ in 1..dots {
        path.push("..");
    }
    for part in rest.split('.') {
        if part.is_empty() {
            return None;
        }
        path.push(part);
    }
    Some((path, dots > 0))
}
