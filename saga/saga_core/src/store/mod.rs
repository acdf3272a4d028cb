//! Saga state store: holds live executions and owns the CAS
//! transition primitive

pub mod backend;

pub use backend::{FileStorage, MemoryStorage, StorageBackend};

use crate::context::TenantContext;
use crate::model::SagaExecution;
use crate::types::{SagaError, SagaStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Store of live saga executions.
///
/// Each execution lives behind its own `RwLock`, which linearizes
/// stack pushes and pops for that execution. Status mutation goes
/// exclusively through [`SagaStateStore::update_status`] (or through
/// `SagaExecution::transition` while a caller already holds the
/// execution's write lock), so racing triggers get at-most-one-winner
/// semantics.
pub struct SagaStateStore {
    /// Live executions by ID
    executions: RwLock<HashMap<String, Arc<RwLock<SagaExecution>>>>,

    /// Optional persistence collaborator for snapshots
    backend: Option<Arc<dyn StorageBackend>>,
}

impl SagaStateStore {
    /// Create a store with no persistence backend
    pub fn new() -> Self {
        SagaStateStore {
            executions: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Attach a persistence backend for best-effort snapshots
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Create a new running execution for a chain
    pub async fn create_execution(
        &self,
        ctx: &TenantContext,
        chain_name: &str,
    ) -> Result<String, SagaError> {
        let execution = SagaExecution::new(ctx, chain_name);
        let execution_id = execution.execution_id.clone();

        self.persist(&execution).await;

        let mut executions = self.executions.write().await;
        executions.insert(execution_id.clone(), Arc::new(RwLock::new(execution)));

        log::info!(
            "created execution {} for chain {} (tenant {})",
            execution_id,
            chain_name,
            ctx.tenant_id
        );
        Ok(execution_id)
    }

    /// Get an execution by ID
    pub async fn get(&self, execution_id: &str) -> Result<Arc<RwLock<SagaExecution>>, SagaError> {
        let executions = self.executions.read().await;
        executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| SagaError::UnknownExecution(execution_id.to_string()))
    }

    /// Get an execution owned by the calling tenant.
    ///
    /// An execution belonging to another tenant is indistinguishable
    /// from a missing one.
    pub async fn get_for_tenant(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Arc<RwLock<SagaExecution>>, SagaError> {
        let execution_lock = self.get(execution_id).await?;
        {
            let execution = execution_lock.read().await;
            if execution.tenant_id != ctx.tenant_id {
                return Err(SagaError::UnknownExecution(execution_id.to_string()));
            }
        }
        Ok(execution_lock)
    }

    /// Compare-and-swap an execution's status.
    ///
    /// The sole transition primitive: commits only if the stored
    /// status equals `expected` at the time of the write, otherwise
    /// fails with `StatusConflict` and performs no mutation.
    pub async fn update_status(
        &self,
        execution_id: &str,
        expected: SagaStatus,
        new: SagaStatus,
    ) -> Result<(), SagaError> {
        let execution_lock = self.get(execution_id).await?;
        let mut execution = execution_lock.write().await;
        execution.transition(expected, new)?;
        self.persist(&execution).await;
        Ok(())
    }

    /// Read an execution's current status
    pub async fn status(&self, execution_id: &str) -> Result<SagaStatus, SagaError> {
        let execution_lock = self.get(execution_id).await?;
        let execution = execution_lock.read().await;
        Ok(execution.status)
    }

    /// List all live execution IDs
    pub async fn list_ids(&self) -> Vec<String> {
        let executions = self.executions.read().await;
        executions.keys().cloned().collect()
    }

    /// Get executions currently in the given status
    pub async fn get_by_status(&self, status: SagaStatus) -> Vec<Arc<RwLock<SagaExecution>>> {
        let executions = self.executions.read().await;
        let mut result = Vec::new();

        for execution_lock in executions.values() {
            let execution = execution_lock.read().await;
            if execution.status == status {
                result.push(execution_lock.clone());
            }
        }

        result
    }

    /// Remove a terminal execution (retention is the storage
    /// collaborator's concern)
    pub async fn remove(&self, execution_id: &str) -> Result<(), SagaError> {
        let mut executions = self.executions.write().await;
        executions
            .remove(execution_id)
            .map(|_| ())
            .ok_or_else(|| SagaError::UnknownExecution(execution_id.to_string()))
    }

    /// Snapshot an execution to the backend, best effort
    pub async fn persist(&self, execution: &SagaExecution) {
        let Some(backend) = &self.backend else {
            return;
        };

        match serde_json::to_vec(execution) {
            Ok(data) => {
                if let Err(e) = backend.store(&execution.execution_id, &data).await {
                    log::warn!("snapshot of {} failed: {}", execution.execution_id, e);
                }
            }
            Err(e) => {
                log::warn!("could not serialize {}: {}", execution.execution_id, e);
            }
        }
    }

    /// Load every snapshot from the backend into memory.
    ///
    /// Used at startup to resume executions after a restart.
    pub async fn restore(&self) -> Result<usize, SagaError> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };

        let keys = backend.list().await?;
        let mut restored = 0;

        for key in keys {
            let data = backend.load(&key).await?;
            let execution: SagaExecution = serde_json::from_slice(&data)
                .map_err(|e| SagaError::Storage(e.to_string()))?;

            let mut executions = self.executions.write().await;
            executions
                .entry(execution.execution_id.clone())
                .or_insert_with(|| Arc::new(RwLock::new(execution)));
            restored += 1;
        }

        Ok(restored)
    }
}

impl Default for SagaStateStore {
    fn default() -> Self {
        Self::new()
    }
}
