//! # Registries (spec.md §4.2)
//!
//! `job_type -> JobDefinition` and `task_type -> TaskHandler`, populated
//! once at startup from explicit registration and immutable thereafter.
//! Decorator-based auto-registration is explicitly rejected (spec.md §4.2,
//! §9) because it has been observed to cause silent omission when modules
//! are not imported; a [`RegistryBuilder`] makes the registration set a
//! single, reviewable list in one place instead.

use std::collections::HashMap;
use std::sync::Arc;

use crate::workflow::{JobDefinition, TaskHandler};

/// Read-only `job_type -> JobDefinition` and `task_type -> TaskHandler`
/// tables. Lookup is O(1); there is no mutation API — build a new
/// [`Registries`] via [`RegistryBuilder`] if the registration set changes.
#[derive(Clone)]
pub struct Registries {
    jobs: Arc<HashMap<String, Arc<dyn JobDefinition>>>,
    handlers: Arc<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl std::fmt::Debug for Registries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registries")
            .field("job_types", &self.jobs.keys().collect::<Vec<_>>())
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registries {
    pub fn job(&self, job_type: &str) -> Option<Arc<dyn JobDefinition>> {
        self.jobs.get(job_type).cloned()
    }

    pub fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

/// Gathers registrations into one place at process initialization
/// (spec.md §9 "Cyclic import-order dependencies" — registration is a
/// single initialization step with no implicit side effects on module
/// load).
#[derive(Default)]
pub struct RegistryBuilder {
    jobs: HashMap<String, Arc<dyn JobDefinition>>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, def: impl JobDefinition + 'static) -> Self {
        self.jobs.insert(def.job_type().to_string(), Arc::new(def));
        self
    }

    pub fn handler(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.handlers
            .insert(handler.task_type().to_string(), Arc::new(handler));
        self
    }

    pub fn build(self) -> Registries {
        Registries {
            jobs: Arc::new(self.jobs),
            handlers: Arc::new(self.handlers),
        }
    }
}
