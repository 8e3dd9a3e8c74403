//! Source-spec generators.
//!
//! A `<kind>.source-spec.yaml` file holds a compact source document that a
//! generator registered under `kind` expands into one or more pipelines.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Error type returned by generators.
pub type GeneratorError = Box<dyn std::error::Error + Send + Sync>;

/// Pipelines produced from a source document, as `(name, details)` pairs.
///
/// A name of the form `:<kind>:` asks for the details to be expanded again
/// as a source document of that kind.
pub type Generated = Vec<(String, Value)>;

/// Expands a source document into pipeline definitions.
pub trait SourceGenerator: Send + Sync {
    /// Returns false if the document is not something this generator accepts.
    fn validate(&self, source: &Value) -> bool;

    /// Expands the document. `base` is the directory of the source file.
    fn generate(&self, source: &Value, base: &Path) -> Result<Generated, GeneratorError>;
}

/// Generators keyed by source kind.
#[derive(Default)]
pub struct GeneratorRegistry {
    generators: RwLock<HashMap<String, Arc<dyn SourceGenerator>>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `generator` for `kind`, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, generator: Arc<dyn SourceGenerator>) {
        self.generators.write().insert(kind.into(), generator);
    }

    /// Generator for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn SourceGenerator>> {
        self.generators.read().get(kind).cloned()
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.generators.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Removes every generator.
    pub fn clear(&self) {
        self.generators.write().clear();
    }
}
