//! Module descriptors and the registry capability.
//!
//! A node's `uses` string names a module, optionally pinned to a version with
//! `name@version`. The registry resolves that reference to a concrete
//! descriptor carrying the runtime name that selects an executor.
//! Project-scoped modules shadow global ones; an unpinned reference resolves
//! to the newest matching registration.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::definition::WorkflowDefinition;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    NotFound(String),
}

/// Resolved descriptor for a `uses` reference.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: String,
    pub name: String,
    pub version: String,
    /// `None` for global modules.
    pub project_id: Option<String>,
    /// Runtime name selecting the executor (`http`, `grpc`, `noop`, ...).
    pub runtime: String,
    pub created_at: DateTime<Utc>,
}

/// Parsed `uses` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub version: Option<String>,
}

impl ModuleRef {
    /// Split `name[@version]`. An empty version suffix means unpinned.
    pub fn parse(uses: &str) -> Self {
        match uses.split_once('@') {
            Some((name, version)) if !version.is_empty() => Self {
                name: name.to_string(),
                version: Some(version.to_string()),
            },
            Some((name, _)) => Self {
                name: name.to_string(),
                version: None,
            },
            None => Self {
                name: uses.to_string(),
                version: None,
            },
        }
    }
}

/// Registry capability consumed by the engine. Implementations may be written
/// to concurrently; the engine sees updates on its next reconciliation pass.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    async fn resolve(&self, project_id: &str, uses: &str) -> Result<Module, ModuleError>;
}

/// In-memory registry for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryModuleRegistry {
    modules: Mutex<Vec<Module>>,
}

impl MemoryModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: Module) {
        let mut modules = self.modules.lock().expect("modules poisoned");
        modules.push(module);
    }

    /// Register a global module under `name` with the given runtime.
    pub fn register_runtime(&self, name: &str, runtime: &str) {
        self.register(Module {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            version: "v1".to_string(),
            project_id: None,
            runtime: runtime.to_string(),
            created_at: Utc::now(),
        });
    }
}

#[async_trait]
impl ModuleRegistry for MemoryModuleRegistry {
    async fn resolve(&self, project_id: &str, uses: &str) -> Result<Module, ModuleError> {
        let reference = ModuleRef::parse(uses);
        let modules = self.modules.lock().expect("modules poisoned");

        let visible = |m: &&Module| {
            m.name == reference.name
                && m.project_id
                    .as_deref()
                    .is_none_or(|p| p == project_id)
                && reference.version.as_deref().is_none_or(|v| m.version == v)
        };

        // Project-scoped registrations shadow global ones; within a scope the
        // newest registration wins.
        let resolved = modules
            .iter()
            .filter(visible)
            .max_by_key(|m| (m.project_id.is_some(), m.created_at));

        resolved
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(uses.to_string()))
    }
}

/// Check that every `uses` reference in a definition (including compensation
/// hooks) resolves against the registry. Run at registration time so broken
/// references never reach the engine.
pub async fn verify_modules(
    def: &WorkflowDefinition,
    registry: &dyn ModuleRegistry,
    project_id: &str,
) -> Result<(), ModuleError> {
    for spec in def.nodes.values() {
        registry.resolve(project_id, &spec.uses).await?;
        if let Some(comp) = &spec.compensate {
            registry.resolve(project_id, &comp.uses).await?;
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
