//! Coordinator facade wiring the ledger, state store, policy
//! resolver, compensation orchestrator, and decision gateway behind
//! the engine- and operator-facing surface

use crate::compensation::{CompensationHandler, CompensationOrchestrator};
use crate::context::TenantContext;
use crate::decision::ManualDecisionGateway;
use crate::ledger::StepLedger;
use crate::model::{ManualDecision, MetadataRegistry, StepData, StepExecution};
use crate::store::{SagaStateStore, StorageBackend};
use crate::types::{FailureVerdict, SagaConfig, SagaError, SagaStatus, StepStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Queued compensation work for the background processor
#[derive(Debug, Clone)]
struct CompensationTask {
    execution_id: String,
    tenant_id: String,
}

/// Saga coordinator.
///
/// The workflow engine reports step lifecycle events through
/// `on_step_*`; operators act through the decision surface. Three
/// trigger sources may hit the same execution concurrently (engine
/// callback, the background compensation loop, an operator), which is
/// why every status move below bottoms out in the store's CAS
/// primitive.
pub struct SagaCoordinator {
    /// Coordinator configuration
    config: SagaConfig,

    /// Shared read-only metadata
    registry: Arc<MetadataRegistry>,

    /// Shared state store
    store: Arc<SagaStateStore>,

    /// Step ledger
    ledger: StepLedger,

    /// Compensation orchestrator
    compensation: Arc<CompensationOrchestrator>,

    /// Manual decision gateway
    gateway: ManualDecisionGateway,

    /// Queue for saga compensations
    compensation_queue: RwLock<VecDeque<CompensationTask>>,

    /// Running flag
    is_running: RwLock<bool>,

    /// Cancellation channel for background tasks
    cancel_tx: broadcast::Sender<()>,
}

impl SagaCoordinator {
    /// Create a new coordinator with an in-memory store
    pub fn new(registry: Arc<MetadataRegistry>, config: SagaConfig) -> Self {
        Self::with_store(registry, config, Arc::new(SagaStateStore::new()))
    }

    /// Create a coordinator whose store snapshots to a persistence
    /// backend
    pub fn with_storage_backend(
        registry: Arc<MetadataRegistry>,
        config: SagaConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self::with_store(
            registry,
            config,
            Arc::new(SagaStateStore::new().with_backend(backend)),
        )
    }

    fn with_store(
        registry: Arc<MetadataRegistry>,
        config: SagaConfig,
        store: Arc<SagaStateStore>,
    ) -> Self {
        let (cancel_tx, _) = broadcast::channel(1);
        let ledger = StepLedger::new(store.clone(), registry.clone());
        let compensation = Arc::new(CompensationOrchestrator::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let gateway =
            ManualDecisionGateway::new(store.clone(), registry.clone(), compensation.clone());

        SagaCoordinator {
            config,
            registry,
            store,
            ledger,
            compensation,
            gateway,
            compensation_queue: RwLock::new(VecDeque::new()),
            is_running: RwLock::new(false),
            cancel_tx,
        }
    }

    /// The underlying state store (tests and admin tooling)
    pub fn store(&self) -> &Arc<SagaStateStore> {
        &self.store
    }

    /// Register a compensation handler for a compensating component
    pub async fn register_compensation_handler(
        &self,
        compensate_component: &str,
        handler: CompensationHandler,
    ) {
        self.compensation
            .register_handler(compensate_component, handler)
            .await;
    }

    /// Start the background task processor and timeout monitor
    pub async fn start(self: &Arc<Self>) -> Result<(), SagaError> {
        {
            let mut is_running = self.is_running.write().await;
            *is_running = true;
        }
        self.start_task_processor();
        self.start_timeout_monitor();
        Ok(())
    }

    /// Stop background tasks
    pub async fn stop(&self) -> Result<(), SagaError> {
        let mut is_running = self.is_running.write().await;
        *is_running = false;
        let _ = self.cancel_tx.send(());
        Ok(())
    }

    /// Begin a new saga execution for a registered chain
    pub async fn begin_chain(
        &self,
        ctx: &TenantContext,
        chain_name: &str,
    ) -> Result<String, SagaError> {
        self.registry.chain(chain_name)?;
        self.store.create_execution(ctx, chain_name).await
    }

    // --- Engine-facing surface -------------------------------------

    /// Engine callback: a step started
    pub async fn on_step_start(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        component_name: &str,
        input_data: StepData,
    ) -> Result<(), SagaError> {
        self.ledger
            .record_step_start(ctx, execution_id, step_id, component_name, input_data)
            .await
    }

    /// Engine callback: a step succeeded
    pub async fn on_step_success(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        output_data: StepData,
    ) -> Result<(), SagaError> {
        self.ledger
            .record_step_success(ctx, execution_id, step_id, output_data)
            .await
    }

    /// Engine callback: a step failed.
    ///
    /// An auto-compensate verdict queues the stack drain on the
    /// background processor.
    pub async fn on_step_failure(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        error_code: &str,
        error_message: &str,
        stack_trace: Option<&str>,
    ) -> Result<FailureVerdict, SagaError> {
        let verdict = self
            .ledger
            .record_step_failure(
                ctx,
                execution_id,
                step_id,
                error_code,
                error_message,
                stack_trace,
            )
            .await?;

        if verdict == FailureVerdict::Compensate {
            self.enqueue_compensation(ctx, execution_id).await;
        }
        Ok(verdict)
    }

    // --- Operator-facing surface -----------------------------------

    /// Submit an operator decision for a parked saga
    pub async fn manual_decision(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        decision: ManualDecision,
    ) -> Result<(), SagaError> {
        self.gateway.submit(ctx, execution_id, decision).await
    }

    /// Operator-triggered compensation with audit
    pub async fn manual_compensate(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.compensation
            .manual_compensate(ctx, execution_id, operator, reason)
            .await
    }

    /// Re-issue one failed step with optional new input
    pub async fn retry_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        new_input: Option<StepData>,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.gateway
            .retry_step(ctx, execution_id, step_id, new_input, operator, reason)
            .await
    }

    /// Skip one failed step and resume forward execution
    pub async fn skip_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.gateway
            .skip_step(ctx, execution_id, step_id, operator, reason)
            .await
    }

    /// Re-attempt one compensation-failed step and resume the drain
    pub async fn retry_compensation(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.compensation
            .retry_compensation(ctx, execution_id, step_id, operator, reason)
            .await
    }

    /// Cancel an execution (cooperative)
    pub async fn cancel(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.gateway.cancel(ctx, execution_id, operator, reason).await
    }

    // --- Audit/preview surface -------------------------------------

    /// Current saga status
    pub async fn status(&self, ctx: &TenantContext, execution_id: &str) -> Result<SagaStatus, SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let execution = execution_lock.read().await;
        Ok(execution.status)
    }

    /// Chronological stack of successful steps
    pub async fn get_execution_stack(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, SagaError> {
        self.ledger.get_execution_stack(ctx, execution_id).await
    }

    /// Stack in compensation (reverse) order, non-mutating preview
    pub async fn get_compensatable_steps(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, SagaError> {
        self.compensation
            .get_compensatable_steps(ctx, execution_id)
            .await
    }

    // --- Background machinery --------------------------------------

    async fn enqueue_compensation(&self, ctx: &TenantContext, execution_id: &str) {
        let mut queue = self.compensation_queue.write().await;
        queue.push_back(CompensationTask {
            execution_id: execution_id.to_string(),
            tenant_id: ctx.tenant_id.clone(),
        });
    }

    async fn dequeue_compensation(&self) -> Option<CompensationTask> {
        let mut queue = self.compensation_queue.write().await;
        queue.pop_front()
    }

    fn start_task_processor(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_millis(50));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !*coordinator.is_running.read().await {
                            break;
                        }
                        while let Some(task) = coordinator.dequeue_compensation().await {
                            let ctx = TenantContext::new(&task.tenant_id);
                            if let Err(e) = coordinator
                                .compensation
                                .compensate(&ctx, &task.execution_id)
                                .await
                            {
                                log::warn!(
                                    "background compensation of {} stopped: {}",
                                    task.execution_id,
                                    e
                                );
                            }
                        }
                    }
                    _ = cancel_rx.recv() => {
                        break;
                    }
                }
            }
        });
    }

    fn start_timeout_monitor(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                coordinator.config.check_interval_ms,
            ));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !*coordinator.is_running.read().await {
                            break;
                        }
                        coordinator.check_step_timeouts().await;
                    }
                    _ = cancel_rx.recv() => {
                        break;
                    }
                }
            }
        });
    }

    /// Convert steps running past their component timeout into
    /// synthetic TIMEOUT failures, which re-enter the failure policy
    /// resolver like any engine-reported failure
    async fn check_step_timeouts(&self) {
        let now = chrono::Utc::now();
        let mut overdue = Vec::new();

        for execution_lock in self.store.get_by_status(SagaStatus::Running).await {
            let execution = execution_lock.read().await;

            for step in execution.steps.values() {
                if step.status != StepStatus::Running {
                    continue;
                }
                let Some(started_at) = step.started_at else {
                    continue;
                };
                let timeout_ms = self
                    .registry
                    .component(&step.component_name)
                    .map(|m| m.timeout_ms)
                    .unwrap_or(self.config.default_timeout_ms);
                if now.signed_duration_since(started_at).num_milliseconds() > timeout_ms as i64 {
                    overdue.push((
                        execution.tenant_id.clone(),
                        execution.execution_id.clone(),
                        step.step_id.clone(),
                        timeout_ms,
                    ));
                }
            }
        }

        for (tenant_id, execution_id, step_id, timeout_ms) in overdue {
            let ctx = TenantContext::new(&tenant_id);
            let message = format!("step timed out after {}ms", timeout_ms);
            match self
                .on_step_failure(&ctx, &execution_id, &step_id, "TIMEOUT", &message, None)
                .await
            {
                Ok(verdict) => log::info!(
                    "execution {}: step {} timed out -> {:?}",
                    execution_id,
                    step_id,
                    verdict
                ),
                // Lost a race with an engine callback or operator;
                // the winner already moved the saga
                Err(e) => log::debug!(
                    "timeout for {} step {} not applied: {}",
                    execution_id,
                    step_id,
                    e
                ),
            }
        }
    }
}
