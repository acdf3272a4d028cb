//! Manual decision gateway: feeds operator decisions back into the
//! state machine

use crate::compensation::CompensationOrchestrator;
use crate::context::TenantContext;
use crate::model::{
    Decision, DecisionRecord, ManualDecision, MetadataRegistry, OperatorAction, StepData,
};
use crate::store::SagaStateStore;
use crate::types::{SagaError, SagaStatus, StepStatus};
use std::sync::Arc;

/// Accepts an operator's out-of-band decision for a parked saga.
///
/// Every decision enters through the same CAS transition primitive
/// as the rest of the system, so a decision submitted after the saga
/// has already moved is rejected with `InvalidDecisionState` rather
/// than silently misapplied.
pub struct ManualDecisionGateway {
    /// Shared state store
    store: Arc<SagaStateStore>,

    /// Shared read-only metadata
    registry: Arc<MetadataRegistry>,

    /// Compensation orchestrator for COMPENSATE decisions
    compensation: Arc<CompensationOrchestrator>,
}

impl ManualDecisionGateway {
    /// Create a new gateway
    pub fn new(
        store: Arc<SagaStateStore>,
        registry: Arc<MetadataRegistry>,
        compensation: Arc<CompensationOrchestrator>,
    ) -> Self {
        ManualDecisionGateway {
            store,
            registry,
            compensation,
        }
    }

    /// Submit an operator decision for a saga in
    /// WaitingManualDecision.
    pub async fn submit(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        decision: ManualDecision,
    ) -> Result<(), SagaError> {
        log::info!(
            "execution {}: operator {} decided {:?} ({})",
            execution_id,
            decision.operator,
            decision.decision,
            decision.reason
        );

        match decision.decision {
            Decision::Continue => {
                self.resume_skipping_failed_step(
                    ctx,
                    execution_id,
                    None,
                    decision.modified_data,
                    OperatorAction::Continue,
                    &decision.operator,
                    &decision.reason,
                )
                .await
            }
            Decision::Retry => {
                self.reset_failed_step(
                    ctx,
                    execution_id,
                    None,
                    decision.modified_data,
                    &decision.operator,
                    &decision.reason,
                )
                .await
            }
            Decision::Compensate => {
                self.compensation
                    .manual_compensate(ctx, execution_id, &decision.operator, &decision.reason)
                    .await
            }
        }
    }

    /// Operator surface: re-issue one failed step with optional new
    /// input. Equivalent to a RETRY decision.
    pub async fn retry_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        new_input: Option<StepData>,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.reset_failed_step(ctx, execution_id, Some(step_id), new_input, operator, reason)
            .await
    }

    /// Operator surface: skip one failed step and resume forward
    /// execution. Equivalent to a CONTINUE decision.
    pub async fn skip_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        self.resume_skipping_failed_step(
            ctx,
            execution_id,
            Some(step_id),
            None,
            OperatorAction::SkipStep,
            operator,
            reason,
        )
        .await
    }

    /// Cancel an execution from any non-terminal state.
    ///
    /// Cooperative: sets the cancel flag consulted before the next
    /// step or compensation attempt; in-flight external calls are not
    /// interrupted.
    pub async fn cancel(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        let current = execution.status;
        execution.transition(current, SagaStatus::Cancelled)?;
        execution.cancel_requested = true;
        execution.record_decision(DecisionRecord::new(OperatorAction::Cancel, operator, reason));

        log::info!(
            "execution {} cancelled by {} ({})",
            execution_id,
            operator,
            reason
        );
        self.store.persist(&execution).await;
        Ok(())
    }

    /// CONTINUE core: failed step becomes Skipped, its replacement
    /// input (if any) is staged for the next step, the saga resumes
    /// Running (or completes when the skipped step was the last).
    #[allow(clippy::too_many_arguments)]
    async fn resume_skipping_failed_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: Option<&str>,
        modified_data: Option<StepData>,
        action: OperatorAction,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        let step_id = self.resolve_failed_step(&execution, execution_id, step_id)?;
        self.enter_running(&mut execution, execution_id)?;

        execution.step_mut(&step_id)?.mark_skipped();
        execution.pending_input = modified_data;
        execution.record_decision(DecisionRecord::new(action, operator, reason));

        let chain = self.registry.chain(&execution.chain_name)?;
        if execution.forward_complete(chain.len()) {
            execution.transition(SagaStatus::Running, SagaStatus::Completed)?;
            log::info!("execution {} completed after skip", execution_id);
        }

        self.store.persist(&execution).await;
        Ok(())
    }

    /// RETRY core: failed step back to Pending with a fresh retry
    /// budget for this manual cycle.
    async fn reset_failed_step(
        &self,
        ctx: &TenantContext,
        execution_id: &str,
        step_id: Option<&str>,
        new_input: Option<StepData>,
        operator: &str,
        reason: &str,
    ) -> Result<(), SagaError> {
        let execution_lock = self.store.get_for_tenant(ctx, execution_id).await?;
        let mut execution = execution_lock.write().await;

        let step_id = self.resolve_failed_step(&execution, execution_id, step_id)?;
        self.enter_running(&mut execution, execution_id)?;

        let step = execution.step_mut(&step_id)?;
        step.reset_for_retry(new_input);
        step.retry_count = 0;
        execution.record_decision(DecisionRecord::new(OperatorAction::Retry, operator, reason));

        self.store.persist(&execution).await;
        Ok(())
    }

    /// CAS WaitingManualDecision -> Running; a lost CAS is the
    /// user-meaningful `InvalidDecisionState` here
    fn enter_running(
        &self,
        execution: &mut crate::model::SagaExecution,
        execution_id: &str,
    ) -> Result<(), SagaError> {
        execution
            .transition(SagaStatus::WaitingManualDecision, SagaStatus::Running)
            .map_err(|e| match e {
                SagaError::StatusConflict(_, _, actual) => {
                    SagaError::InvalidDecisionState(execution_id.to_string(), actual)
                }
                other => other,
            })
    }

    /// Resolve the step an operator decision applies to. An explicit
    /// step must be in Failed state; skipping or retrying a step that
    /// actually succeeded would corrupt the execution stack, so it is
    /// rejected before any status is touched.
    fn resolve_failed_step(
        &self,
        execution: &crate::model::SagaExecution,
        execution_id: &str,
        step_id: Option<&str>,
    ) -> Result<String, SagaError> {
        match step_id {
            Some(id) => {
                let step = execution.step(id)?;
                if step.status != StepStatus::Failed {
                    return Err(SagaError::Other(format!(
                        "step {} is {:?}, not FAILED",
                        id, step.status
                    )));
                }
                Ok(id.to_string())
            }
            None => self.failed_step_id(execution, execution_id),
        }
    }

    fn failed_step_id(
        &self,
        execution: &crate::model::SagaExecution,
        execution_id: &str,
    ) -> Result<String, SagaError> {
        execution
            .steps
            .values()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.step_id.clone())
            .ok_or_else(|| {
                SagaError::Other(format!("no failed step recorded for {}", execution_id))
            })
    }
}
