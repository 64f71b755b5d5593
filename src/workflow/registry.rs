/// Hot-reload workflow registry using ArcSwap
///
/// Provides lock-free, atomic updates to the in-memory registry of active
/// workflow definitions. Each update swaps the entire registry pointer, so
/// hot reloads never block runs that are already executing against the
/// previous definition.

use crate::workflow::graph::StepGraph;
use crate::workflow::storage::WorkflowStorage;
use crate::workflow::types::WorkflowDefinition;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Lock-free registry of validated workflow definitions
///
/// The registry is the single source of truth for which definitions may be
/// started. Every definition passes graph validation before it is admitted,
/// so a cycle or a dangling output reference can never reach execution.
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Atomic pointer to the definition map, keyed by workflow id
    workflows: ArcSwap<HashMap<String, Arc<WorkflowDefinition>>>,

    /// Persistent storage backing reload operations
    storage: WorkflowStorage,
}

impl WorkflowRegistry {
    /// Create new registry instance with storage backend
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Initialize registry by loading all workflows from storage
    ///
    /// Called during startup. Definitions that fail validation are logged and
    /// skipped rather than taking the whole service down.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;

        let mut validated = HashMap::new();
        for (id, definition) in stored {
            match StepGraph::build(&definition) {
                Ok(_) => {
                    validated.insert(id, Arc::new(definition));
                }
                Err(e) => {
                    tracing::error!("❌ Skipping invalid stored workflow '{}': {}", id, e);
                }
            }
        }

        // Atomic swap of the entire registry
        self.workflows.store(Arc::new(validated));

        tracing::info!(
            "📋 Initialized workflow registry with {} workflows",
            self.workflows.load().len()
        );
        Ok(())
    }

    /// Hot-reload a single workflow from storage
    ///
    /// Validates the fresh definition, then swaps it into the registry with
    /// an atomic pointer update. Runs started against the old definition
    /// keep their own Arc and finish undisturbed.
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let definition = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;

        StepGraph::build(&definition)?;

        let current = self.workflows.load();
        let mut next = (**current).clone();
        next.insert(workflow_id.to_string(), Arc::new(definition));
        self.workflows.store(Arc::new(next));

        tracing::info!("🔄 Hot-reloaded workflow: {}", workflow_id);
        Ok(())
    }

    /// Get a workflow definition by id (lock-free read)
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// All active definitions, for trigger activation at startup
    pub fn all_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.load().values().cloned().collect()
    }

    /// List all active workflow ids
    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }

    /// Remove a workflow from the registry
    pub fn remove_workflow(&self, workflow_id: &str) {
        let current = self.workflows.load();
        let mut next = (**current).clone();
        if next.remove(workflow_id).is_some() {
            self.workflows.store(Arc::new(next));
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
    }
}
