//! The long-lived context every component works through.
//!
//! One [`Orchestrator`] is built per process. It owns the settings, the
//! executable resolver cache, the source generators, the step runners, the
//! status store and the dependency graph, and hands out borrows of them.

use crate::config::Settings;
use crate::engine::RunnerRegistry;
use crate::errors::Result;
use crate::scheduler::DependencyGraph;
use crate::specs::{
    ArtifactSource, Discovery, DiscoveryOptions, ExecutableResolver, GeneratorRegistry,
    LocalArtifacts,
};
use crate::status::{InMemoryBackend, StatusStore};
use std::sync::Arc;

/// Shared state for discovery, execution and scheduling.
pub struct Orchestrator {
    settings: Settings,
    resolver: ExecutableResolver,
    generators: GeneratorRegistry,
    runners: RunnerRegistry,
    artifacts: Arc<dyn ArtifactSource>,
    status: StatusStore,
    graph: DependencyGraph,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root_dir", &self.settings.root_dir)
            .field("status", &self.status)
            .field("runners", &self.runners.names())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Connects to the configured status backend and loads runners.
    pub fn new(settings: Settings) -> Result<Self> {
        let status = StatusStore::connect(&settings)?;
        Self::with_status(settings, status)
    }

    /// Uses an existing status store.
    pub fn with_status(settings: Settings, status: StatusStore) -> Result<Self> {
        let runners = RunnerRegistry::load(&settings.runner_config_path())?;
        Ok(Self {
            resolver: ExecutableResolver::from_settings(&settings),
            generators: GeneratorRegistry::new(),
            runners,
            artifacts: Arc::new(LocalArtifacts),
            graph: DependencyGraph::new(Arc::clone(status.backend())),
            reconcile_lock: tokio::sync::Mutex::new(()),
            status,
            settings,
        })
    }

    /// An orchestrator whose status lives only in memory.
    pub fn in_memory(settings: Settings) -> Result<Self> {
        let status = StatusStore::with_backend(Arc::new(InMemoryBackend::new()), &settings);
        Self::with_status(settings, status)
    }

    /// Replaces the source of dependency artifact descriptors.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Replaces the runner registry.
    #[must_use]
    pub fn with_runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = runners;
        self
    }

    /// Settings in effect.
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Executable resolver.
    pub const fn resolver(&self) -> &ExecutableResolver {
        &self.resolver
    }

    /// Source generators; register custom kinds here before discovery.
    pub const fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    /// Step runners.
    pub const fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// Status store.
    pub const fn status(&self) -> &StatusStore {
        &self.status
    }

    /// Dependency graph.
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Held for the whole of a reconcile pass; passes in one process never
    /// interleave.
    pub(crate) const fn reconcile_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.reconcile_lock
    }

    /// Starts a discovery pass over the root directory.
    pub fn discover(&self, options: DiscoveryOptions) -> Discovery<'_> {
        Discovery::new(
            &self.settings.root_dir,
            &self.resolver,
            &self.generators,
            self.artifacts.as_ref(),
            &self.status,
            options,
        )
    }

    /// Forgets cached resolutions and wipes the status store.
    pub fn reset(&self) -> Result<()> {
        self.resolver.clear();
        self.status.reset()?;
        Ok(())
    }
}
