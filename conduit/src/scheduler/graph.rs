//! Persisted dependency edges between pipelines.
//!
//! Both directions are kept as backend sets: `Dependencies:<id>` lists what
//! `id` needs, `Dependents:<id>` lists who needs `id`.

use crate::status::{StatusBackend, StoreResult};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

fn dependencies_key(pipeline_id: &str) -> String {
    format!("Dependencies:{pipeline_id}")
}

fn dependents_key(pipeline_id: &str) -> String {
    format!("Dependents:{pipeline_id}")
}

/// Forward and reverse dependency adjacency.
#[derive(Clone)]
pub struct DependencyGraph {
    backend: Arc<dyn StatusBackend>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl DependencyGraph {
    /// Graph stored in `backend`.
    pub fn new(backend: Arc<dyn StatusBackend>) -> Self {
        Self { backend }
    }

    /// Replaces the dependencies of `pipeline_id`.
    pub fn update(&self, pipeline_id: &str, dependencies: &[String]) -> StoreResult<()> {
        for stale in self.dependencies(pipeline_id)? {
            if !dependencies.contains(&stale) {
                self.backend.set_remove(&dependents_key(&stale), pipeline_id)?;
                self.backend
                    .set_remove(&dependencies_key(pipeline_id), &stale)?;
            }
        }
        for dependency in dependencies {
            self.backend
                .set_add(&dependencies_key(pipeline_id), dependency)?;
            self.backend
                .set_add(&dependents_key(dependency), pipeline_id)?;
        }
        Ok(())
    }

    /// Drops every edge touching `pipeline_id`, in both directions.
    pub fn remove(&self, pipeline_id: &str) -> StoreResult<()> {
        for dependency in self.dependencies(pipeline_id)? {
            self.backend
                .set_remove(&dependents_key(&dependency), pipeline_id)?;
        }
        for dependent in self.dependents(pipeline_id)? {
            self.backend
                .set_remove(&dependencies_key(&dependent), pipeline_id)?;
        }
        self.backend.del(&dependencies_key(pipeline_id))?;
        self.backend.del(&dependents_key(pipeline_id))
    }

    /// Pipelines `pipeline_id` depends on, sorted.
    pub fn dependencies(&self, pipeline_id: &str) -> StoreResult<Vec<String>> {
        self.backend.set_members(&dependencies_key(pipeline_id))
    }

    /// Pipelines depending on `pipeline_id`, sorted.
    pub fn dependents(&self, pipeline_id: &str) -> StoreResult<Vec<String>> {
        self.backend.set_members(&dependents_key(pipeline_id))
    }

    /// Every transitive dependent of `pipeline_id` in breadth-first order,
    /// each listed once and never `pipeline_id` itself.
    pub fn transitive_dependents(&self, pipeline_id: &str) -> StoreResult<Vec<String>> {
        let mut seen: HashSet<String> = HashSet::from([pipeline_id.to_string()]);
        let mut queue: VecDeque<String> = VecDeque::from([pipeline_id.to_string()]);
        let mut order = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current)? {
                if seen.insert(dependent.clone()) {
                    order.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        Ok(order)
    }
}
