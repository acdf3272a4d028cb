//! Step ledger: append-only record of step lifecycle events and the
//! execution stack used for compensation

use crate::context::TenantContext;
use crate::model::{MetadataRegistry, SagaExecution, StepData, StepExecution};
use crate::policy::FailurePolicyResolver;
use crate::store::SagaStateStore;
use crate::types::{FailureVerdict, SagaError, SagaStatus, StepStatus};
use std::sync::Arc;

/// Records step start/success/failure reported by the workflow
/// engine and maintains the chronological stack of successful steps.
///
/// All mutation of one execution happens under that execution's
/// write lock, so the resolver verdict for a failure is applied
/// atomically with the step's status write.
pub struct StepLedger {
    /// Shared state store
    store: Arc<SagaStateStore>,

    /// Shared read-only metadata
    registry: Arc<MetadataRegistry>,

    /// Failure policy resolver
    resolver: FailurePolicyResolver,
}

impl StepLedger {
    /// Create a new ledger
    pub fn new(store: Arc<SagaStateStore>, registry: Arc<MetadataRegistry>) -> Self {
        let resolver = FailurePolicyResolver::new(registry.clone());
        StepLedger {
            store,
            registry,
            resolver,
        }
    }

    /// Record the start of a step.
    ///
    /// Creates the step in Running state. A step ID already recorded
    /// for this execution is a `DuplicateStep`, unless the step is
    /// Pending (a retry of the current step), in which case the
    /// existing step re-enters Running. A saga that is not accepting
    /// new steps surfaces as `UnknownExecution`.
    pub async fn record_step_start(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        component_name: &str,
        input_data: StepData,
    ) -> Result<(), SagaError> {
        // Component must be registered before any step of it runs
        self.registry.component(component_name)?;

        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        if execution.status != SagaStatus::Running {
            return Err(SagaError::UnknownExecution(execution_id.to_string()));
        }

        if let Some(step) = execution.steps.get_mut(step_id) {
            if step.status != StepStatus::Pending {
                return Err(SagaError::DuplicateStep(
                    execution_id.to_string(),
                    step_id.to_string(),
                ));
            }
            // Retry of the current step
            step.mark_running();
        } else {
            // An operator CONTINUE may have staged replacement input
            // for the next step
            let input = execution.pending_input.take().unwrap_or(input_data);
            let step = StepExecution::new(step_id, component_name, input);
            execution.steps.insert(step_id.to_string(), step);
        }

        log::debug!(
            "execution {}: step {} ({}) running",
            execution_id,
            step_id,
            component_name
        );
        self.store.persist(&execution).await;
        Ok(())
    }

    /// Record a successful step and push it onto the execution stack.
    ///
    /// Idempotent: a second success report for an already-SUCCESS
    /// step is a no-op, protecting against duplicate delivery from
    /// the engine. When the chain's last step succeeds the saga
    /// transitions Running -> Completed.
    pub async fn record_step_success(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        output_data: StepData,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        {
            let step = execution.step(step_id)?;
            if step.status == StepStatus::Success {
                log::debug!(
                    "execution {}: duplicate success for step {}, ignoring",
                    execution_id,
                    step_id
                );
                return Ok(());
            }
        }

        execution.step_mut(step_id)?.mark_success(output_data);
        execution.push_stack(step_id);
        log::debug!("execution {}: step {} succeeded", execution_id, step_id);

        self.complete_if_last(&mut execution)?;
        self.store.persist(&execution).await;
        Ok(())
    }

    /// Record a failed step, resolve the failure policy, and apply
    /// the verdict atomically with the status write.
    ///
    /// Returns the applied verdict so the engine knows whether to
    /// re-issue the step, continue, or stop sending events.
    pub async fn record_step_failure(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        error_code: &str,
        error_message: &str,
        stack_trace: Option<&str>,
    ) -> Result<FailureVerdict, SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        if execution.status != SagaStatus::Running {
            return Err(SagaError::StatusConflict(
                execution_id.to_string(),
                SagaStatus::Running,
                execution.status,
            ));
        }

        let (component_name, retry_count) = {
            let step = execution.step_mut(step_id)?;
            step.mark_failed(error_code, error_message, stack_trace);
            (step.component_name.clone(), step.retry_count)
        };

        let mut verdict = self
            .resolver
            .resolve(&component_name, error_code, retry_count)?;

        // A compensation verdict with nothing on the stack means
        // there is nothing to undo: the saga simply fails
        if verdict == FailureVerdict::Compensate
            && execution.compensatable_step_ids().is_empty()
        {
            verdict = FailureVerdict::FailFast;
        }

        match verdict {
            FailureVerdict::Retry { attempt, max } => {
                let step = execution.step_mut(step_id)?;
                step.increment_retry();
                step.reset_for_retry(None);
                log::info!(
                    "execution {}: step {} retry {}/{}",
                    execution_id,
                    step_id,
                    attempt,
                    max
                );
            }
            FailureVerdict::Compensate => {
                execution.transition(SagaStatus::Running, SagaStatus::Compensating)?;
            }
            FailureVerdict::Skip => {
                execution.step_mut(step_id)?.mark_skipped();
                log::info!(
                    "execution {}: step {} skipped by policy",
                    execution_id,
                    step_id
                );
                self.complete_if_last(&mut execution)?;
            }
            FailureVerdict::ManualDecision => {
                execution.transition(SagaStatus::Running, SagaStatus::WaitingManualDecision)?;
            }
            FailureVerdict::FailFast => {
                execution.transition(SagaStatus::Running, SagaStatus::Failed)?;
            }
        }

        log::info!(
            "execution {}: step {} failed with {} -> {:?}",
            execution_id,
            step_id,
            error_code,
            verdict
        );
        self.store.persist(&execution).await;
        Ok(verdict)
    }

    /// The ordered (chronological) sequence of SUCCESS-state steps.
    ///
    /// Used by the compensation orchestrator and for audit/timeline
    /// display.
    pub async fn get_execution_stack(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
    ) -> Result<Vec<StepExecution>, SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let execution = execution_lock.read().await;
        Ok(execution
            .stack_steps()
            .into_iter()
            .filter(|s| s.status == StepStatus::Success)
            .cloned()
            .collect())
    }

    /// Transition Running -> Completed when every chain component has
    /// reached Success or Skipped
    fn complete_if_last(&self, execution: &mut SagaExecution) -> Result<(), SagaError> {
        if execution.status != SagaStatus::Running {
            return Ok(());
        }

        let chain = self.registry.chain(&execution.chain_name)?;
        if execution.forward_complete(chain.len()) {
            execution.transition(SagaStatus::Running, SagaStatus::Completed)?;
            log::info!("execution {} completed", execution.execution_id);
        }
        Ok(())
    }
}
