//! Compensation orchestration: drains the execution stack in reverse,
//! invoking registered compensating actions with bounded retries

use crate::context::TenantContext;
use crate::model::{DecisionRecord, MetadataRegistry, OperatorAction, StepExecution};
use crate::store::SagaStateStore;
use crate::types::{SagaConfig, SagaError, SagaStatus, StepStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};

/// Handler function type for compensating actions.
///
/// Receives the step to undo; the step's recorded `output_data` is
/// the compensation input.
pub type CompensationHandler = Arc<
    dyn Fn(&StepExecution) -> Box<dyn Future<Output = Result<(), String>> + Send + Unpin>
        + Send
        + Sync,
>;

/// Walks an execution's stack strictly LIFO and invokes each step's
/// compensating action.
///
/// Attempts per step are bounded by `SagaConfig::max_compensation_attempts`
/// with a fixed delay between attempts; a step that exhausts its
/// attempts halts the drain and moves the saga to CompensationFailed.
/// Draining never skips ahead past a step it cannot undo.
pub struct CompensationOrchestrator {
    /// Shared state store
    store: Arc<SagaStateStore>,

    /// Shared read-only metadata
    registry: Arc<MetadataRegistry>,

    /// Retry/timeout configuration
    config: SagaConfig,

    /// Compensation handlers by compensating component name
    handlers: RwLock<HashMap<String, CompensationHandler>>,
}

impl CompensationOrchestrator {
    /// Create a new compensation orchestrator
    pub fn new(
        store: Arc<SagaStateStore>,
        registry: Arc<MetadataRegistry>,
        config: SagaConfig,
    ) -> Self {
        CompensationOrchestrator {
            store,
            registry,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a compensation handler for a compensating component
    pub async fn register_handler(&self, compensate_component: &str, handler: CompensationHandler) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(compensate_component.to_string(), handler);
    }

    /// Drain the execution stack of a saga in Compensating state.
    ///
    /// Ends with the saga Compensated when every stacked step is
    /// undone, or CompensationFailed (and `CompensationExhausted`)
    /// when a step's compensating action permanently fails.
    pub async fn compensate(&self, ctx: &TenantContext, execution_id: &str) -> Result<(), SagaError> {
        {
            let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
            let execution = execution_lock.read().await;
            if execution.status != SagaStatus::Compensating {
                return Err(SagaError::StatusConflict(
                    execution_id.to_string(),
                    SagaStatus::Compensating,
                    execution.status,
                ));
            }
        }

        self.drain(ctx, execution_id).await
    }

    /// Equivalent to [`compensate`](Self::compensate) but operator
    /// triggered: requires WaitingManualDecision or CompensationFailed
    /// and records the operator identity for audit. Steps whose
    /// compensation previously failed get a fresh attempt budget.
    pub async fn manual_compensate(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        {
            let mut execution = execution_lock.write().await;
            let from = execution.status;
            if from != SagaStatus::WaitingManualDecision && from != SagaStatus::CompensationFailed {
                return Err(SagaError::InvalidDecisionState(
                    execution_id.to_string(),
                    from,
                ));
            }
            execution.transition(from, SagaStatus::Compensating)?;

            let failed: Vec<String> = execution
                .stack
                .iter()
                .filter(|id| {
                    execution
                        .steps
                        .get(*id)
                        .map(|s| s.status == StepStatus::CompensationFailed)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            for step_id in failed {
                execution.step_mut(&step_id)?.reset_compensation();
            }

            execution.record_decision(DecisionRecord::new(
                OperatorAction::Compensate,
                operator,
                reason,
            ));
            self.store.persist(&execution).await;
        }

        log::info!(
            "execution {}: manual compensation triggered by {}",
            execution_id,
            operator
        );
        self.drain(ctx, execution_id).await
    }

    /// Re-attempt exactly one COMPENSATION_FAILED step and, on
    /// success, resume draining the remainder of the stack.
    pub async fn retry_compensation(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        {
            let mut execution = execution_lock.write().await;

            // Validate the target before touching saga status, so a
            // rejected request leaves CompensationFailed intact
            let step_status = execution.step(step_id)?.status;
            if step_status != StepStatus::CompensationFailed {
                return Err(SagaError::Other(format!(
                    "step {} is {:?}, not COMPENSATION_FAILED",
                    step_id, step_status
                )));
            }

            execution.transition(SagaStatus::CompensationFailed, SagaStatus::Compensating)?;
            execution.step_mut(step_id)?.reset_compensation();
            execution.record_decision(DecisionRecord::new(
                OperatorAction::RetryCompensation,
                operator,
                reason,
            ));
            self.store.persist(&execution).await;
        }

        self.compensate_step(ctx, execution_id, step_id).await?;
        self.drain(ctx, execution_id).await
    }

    /// Compensate a single step with the bounded attempt loop.
    ///
    /// Exposed for operator-driven retry of one step. On exhaustion
    /// the saga moves to CompensationFailed and the error is
    /// `CompensationExhausted`.
    pub async fn compensate_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;

        // Metadata for the step's component, looked up outside the
        // attempt loop
        let (component_name, step_status) = {
            let execution = execution_lock.read().await;
            let step = execution.step(step_id)?;
            (step.component_name.clone(), step.status)
        };

        if step_status == StepStatus::Compensated || step_status == StepStatus::Skipped {
            return Ok(());
        }
        if step_status != StepStatus::Success {
            return Err(SagaError::Other(format!(
                "step {} is {:?}; only successful steps are compensated",
                step_id, step_status
            )));
        }

        let metadata = self.registry.component(&component_name)?;

        // Nothing to undo for this component
        if !metadata.has_compensation() || !metadata.needs_compensation {
            let mut execution = execution_lock.write().await;
            execution.step_mut(step_id)?.mark_compensated();
            log::debug!(
                "execution {}: step {} has no compensating action, marked compensated",
                execution_id,
                step_id
            );
            self.store.persist(&execution).await;
            return Ok(());
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&metadata.compensate_component)
                .cloned()
                .ok_or_else(|| SagaError::UnknownComponent(metadata.compensate_component.clone()))?
        };

        let timeout_duration = Duration::from_millis(if metadata.timeout_ms > 0 {
            metadata.timeout_ms
        } else {
            self.config.default_timeout_ms
        });

        let mut last_error = String::new();
        loop {
            // Cancelled or externally moved sagas stop attempting
            let step_snapshot = {
                let mut execution = execution_lock.write().await;
                if execution.status != SagaStatus::Compensating {
                    log::debug!(
                        "execution {}: no longer compensating, stopping attempts on {}",
                        execution_id,
                        step_id
                    );
                    return Ok(());
                }
                let step = execution.step_mut(step_id)?;
                if step.compensation_attempts >= self.config.max_compensation_attempts {
                    break;
                }
                step.mark_compensating();
                step.increment_compensation_attempts();
                let snapshot = step.clone();
                self.store.persist(&execution).await;
                snapshot
            };

            let attempt = step_snapshot.compensation_attempts;
            let result = match timeout(timeout_duration, (handler)(&step_snapshot)).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "compensation timed out after {}ms",
                    timeout_duration.as_millis()
                )),
            };

            match result {
                Ok(()) => {
                    let mut execution = execution_lock.write().await;
                    execution.step_mut(step_id)?.mark_compensated();
                    log::info!(
                        "execution {}: step {} compensated (attempt {})",
                        execution_id,
                        step_id,
                        attempt
                    );
                    self.store.persist(&execution).await;
                    return Ok(());
                }
                Err(error) => {
                    log::warn!(
                        "execution {}: compensation attempt {}/{} for step {} failed: {}",
                        execution_id,
                        attempt,
                        self.config.max_compensation_attempts,
                        step_id,
                        error
                    );
                    last_error = error;
                    if attempt < self.config.max_compensation_attempts {
                        sleep(Duration::from_millis(self.config.compensation_retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        // Ceiling exceeded: freeze the step and the saga
        {
            let mut execution = execution_lock.write().await;
            execution
                .step_mut(step_id)?
                .mark_compensation_failed(&last_error);
            // Another trigger (e.g. cancel) may have moved the saga
            // already; the step state still records the exhaustion
            if let Err(e) =
                execution.transition(SagaStatus::Compensating, SagaStatus::CompensationFailed)
            {
                log::warn!("execution {}: {}", execution_id, e);
            }
            self.store.persist(&execution).await;
        }

        Err(SagaError::CompensationExhausted(
            execution_id.to_string(),
            step_id.to_string(),
        ))
    }

    /// The current stack in compensation (reverse chronological)
    /// order, without mutating it. Used for preview/audit.
    pub async fn get_compensatable_steps(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let execution = execution_lock.read().await;

        let mut steps = Vec::new();
        for step_id in execution.compensatable_step_ids() {
            steps.push(execution.step(&step_id)?.clone());
        }
        Ok(steps)
    }

    /// Drain loop: undo the most recently pushed step first, halt on
    /// exhaustion, finish with Compensating -> Compensated
    async fn drain(&self, ctx: &TenantContext, execution_id: &str) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;

        loop {
            let next = {
                let execution = execution_lock.read().await;
                if execution.status != SagaStatus::Compensating {
                    // Cancelled or raced elsewhere; stop quietly
                    return Ok(());
                }
                if execution.cancel_requested {
                    log::info!(
                        "execution {}: cancel requested, stopping compensation",
                        execution_id
                    );
                    return Ok(());
                }
                execution.compensatable_step_ids().into_iter().next()
            };

            match next {
                Some(step_id) => {
                    self.compensate_step(ctx, execution_id, &step_id).await?;
                }
                None => {
                    self.store
                        .update_status(execution_id, SagaStatus::Compensating, SagaStatus::Compensated)
                        .await?;
                    log::info!("execution {} fully compensated", execution_id);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainDefinition, SagaMetadata, StepData};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn ctx() -> TenantContext {
        TenantContext::new("tenant-1")
    }

    fn registry() -> Arc<MetadataRegistry> {
        let mut registry = MetadataRegistry::new();
        registry.register_chain(ChainDefinition::new(
            "OrderFlow",
            vec!["Reserve", "Charge", "Ship"],
        ));
        registry.register_component(SagaMetadata::new("Reserve").with_compensation("Release"));
        registry.register_component(SagaMetadata::new("Charge").with_compensation("Refund"));
        registry.register_component(SagaMetadata::new("Ship"));
        Arc::new(registry)
    }

    async fn seed_execution(store: &SagaStateStore, components: &[(&str, &str)]) -> String {
        let execution_id = store.create_execution(&ctx(), "OrderFlow").await.unwrap();
        let execution_lock = store.get(&execution_id).await.unwrap();
        let mut execution = execution_lock.write().await;
        for (step_id, component) in components {
            let mut step = StepExecution::new(step_id, component, StepData::new());
            step.mark_success(StepData::new());
            execution.steps.insert(step_id.to_string(), step);
            execution.push_stack(step_id);
        }
        execution
            .transition(SagaStatus::Running, SagaStatus::Compensating)
            .unwrap();
        execution_id
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, name: &str) -> CompensationHandler {
        let name = name.to_string();
        Arc::new(move |_step| {
            let log = log.clone();
            let name = name.clone();
            Box::new(Box::pin(async move {
                log.lock().await.push(name);
                Ok(())
            }))
        })
    }

    #[tokio::test]
    async fn test_drain_reverse_order() {
        let store = Arc::new(SagaStateStore::new());
        let config = SagaConfig {
            compensation_retry_delay_ms: 1,
            ..Default::default()
        };
        let orch = CompensationOrchestrator::new(store.clone(), registry(), config);

        let order = Arc::new(Mutex::new(Vec::new()));
        orch.register_handler("Release", recording_handler(order.clone(), "Release"))
            .await;
        orch.register_handler("Refund", recording_handler(order.clone(), "Refund"))
            .await;

        let execution_id =
            seed_execution(&store, &[("s1", "Reserve"), ("s2", "Charge")]).await;

        orch.compensate(&ctx(), &execution_id).await.unwrap();

        // Charge was pushed last so its compensation runs first
        assert_eq!(*order.lock().await, vec!["Refund", "Release"]);
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::Compensated
        );
    }

    #[tokio::test]
    async fn test_bounded_attempts_halt_drain() {
        let store = Arc::new(SagaStateStore::new());
        let config = SagaConfig {
            max_compensation_attempts: 3,
            compensation_retry_delay_ms: 1,
            ..Default::default()
        };
        let orch = CompensationOrchestrator::new(store.clone(), registry(), config);

        let refund_calls = Arc::new(AtomicU32::new(0));
        let release_calls = Arc::new(AtomicU32::new(0));

        let counter = refund_calls.clone();
        orch.register_handler(
            "Refund",
            Arc::new(move |_step| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(Box::pin(async move { Err("refund rejected".to_string()) }))
            }),
        )
        .await;
        let counter = release_calls.clone();
        orch.register_handler(
            "Release",
            Arc::new(move |_step| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(Box::pin(async move { Ok(()) }))
            }),
        )
        .await;

        let execution_id =
            seed_execution(&store, &[("s1", "Reserve"), ("s2", "Charge")]).await;

        let err = orch.compensate(&ctx(), &execution_id).await.unwrap_err();
        assert!(matches!(err, SagaError::CompensationExhausted(_, _)));

        // Exactly the ceiling, and the drain never reached Reserve
        assert_eq!(refund_calls.load(Ordering::SeqCst), 3);
        assert_eq!(release_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::CompensationFailed
        );

        let execution_lock = store.get(&execution_id).await.unwrap();
        let execution = execution_lock.read().await;
        assert_eq!(
            execution.steps["s2"].status,
            StepStatus::CompensationFailed
        );
        assert_eq!(execution.steps["s1"].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_compensation_resumes_drain() {
        let store = Arc::new(SagaStateStore::new());
        let config = SagaConfig {
            max_compensation_attempts: 1,
            compensation_retry_delay_ms: 1,
            ..Default::default()
        };
        let orch = CompensationOrchestrator::new(store.clone(), registry(), config);

        // Refund fails the first invocation, succeeds afterwards
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        orch.register_handler(
            "Refund",
            Arc::new(move |_step| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::new(Box::pin(async move {
                    if n == 0 {
                        Err("transient".to_string())
                    } else {
                        Ok(())
                    }
                }))
            }),
        )
        .await;
        let order = Arc::new(Mutex::new(Vec::new()));
        orch.register_handler("Release", recording_handler(order.clone(), "Release"))
            .await;

        let execution_id =
            seed_execution(&store, &[("s1", "Reserve"), ("s2", "Charge")]).await;

        assert!(orch.compensate(&ctx(), &execution_id).await.is_err());
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::CompensationFailed
        );

        orch.retry_compensation(&ctx(), &execution_id, "s2", "ops-alice", "downstream recovered")
            .await
            .unwrap();

        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::Compensated
        );
        assert_eq!(*order.lock().await, vec!["Release"]);

        let execution_lock = store.get(&execution_id).await.unwrap();
        let execution = execution_lock.read().await;
        assert_eq!(execution.decisions.len(), 1);
        assert_eq!(
            execution.decisions[0].action,
            OperatorAction::RetryCompensation
        );
    }

    #[tokio::test]
    async fn test_retry_compensation_rejects_wrong_step_without_state_change() {
        let store = Arc::new(SagaStateStore::new());
        let config = SagaConfig {
            max_compensation_attempts: 1,
            compensation_retry_delay_ms: 1,
            ..Default::default()
        };
        let orch = CompensationOrchestrator::new(store.clone(), registry(), config);

        // Refund fails the first invocation, succeeds afterwards
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        orch.register_handler(
            "Refund",
            Arc::new(move |_step| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::new(Box::pin(async move {
                    if n == 0 {
                        Err("transient".to_string())
                    } else {
                        Ok(())
                    }
                }))
            }),
        )
        .await;
        orch.register_handler("Release", recording_handler(Arc::new(Mutex::new(Vec::new())), "Release"))
            .await;

        let execution_id =
            seed_execution(&store, &[("s1", "Reserve"), ("s2", "Charge")]).await;

        assert!(orch.compensate(&ctx(), &execution_id).await.is_err());
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::CompensationFailed
        );

        // Naming a step that never failed compensation is rejected
        // and must not move the saga off CompensationFailed
        assert!(orch
            .retry_compensation(&ctx(), &execution_id, "s1", "ops-alice", "typo")
            .await
            .is_err());
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::CompensationFailed
        );

        // The corrected request still goes through
        orch.retry_compensation(&ctx(), &execution_id, "s2", "ops-alice", "right step")
            .await
            .unwrap();
        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::Compensated
        );
    }

    #[tokio::test]
    async fn test_step_without_compensation_is_marked_compensated() {
        let store = Arc::new(SagaStateStore::new());
        let orch =
            CompensationOrchestrator::new(store.clone(), registry(), SagaConfig::default());

        // Ship has no compensating action
        let execution_id = seed_execution(&store, &[("s1", "Ship")]).await;
        orch.compensate(&ctx(), &execution_id).await.unwrap();

        assert_eq!(
            store.status(&execution_id).await.unwrap(),
            SagaStatus::Compensated
        );
        let execution_lock = store.get(&execution_id).await.unwrap();
        let execution = execution_lock.read().await;
        assert_eq!(execution.steps["s1"].status, StepStatus::Compensated);
    }

    #[tokio::test]
    async fn test_get_compensatable_steps_does_not_mutate() {
        let store = Arc::new(SagaStateStore::new());
        let orch =
            CompensationOrchestrator::new(store.clone(), registry(), SagaConfig::default());

        let execution_id =
            seed_execution(&store, &[("s1", "Reserve"), ("s2", "Charge")]).await;

        let steps = orch
            .get_compensatable_steps(&ctx(), &execution_id)
            .await
            .unwrap();
        let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);

        // Preview leaves the stack untouched
        let again = orch
            .get_compensatable_steps(&ctx(), &execution_id)
            .await
            .unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_compensate_requires_compensating_status() {
        let store = Arc::new(SagaStateStore::new());
        let orch =
            CompensationOrchestrator::new(store.clone(), registry(), SagaConfig::default());

        let execution_id = store.create_execution(&ctx(), "OrderFlow").await.unwrap();
        let err = orch.compensate(&ctx(), &execution_id).await.unwrap_err();
        assert!(matches!(err, SagaError::StatusConflict(_, _, _)));
    }
}
