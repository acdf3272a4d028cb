use crate::context::TenantContext;
use crate::model::decision::DecisionRecord;
use crate::model::step::{StepData, StepExecution};
use crate::types::{SagaError, SagaStatus, StepStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One saga execution (aggregate root).
///
/// Exclusively owns its steps and the execution stack. All mutation
/// happens under the per-execution lock held by the state store, so
/// the stack is never observed torn or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecution {
    /// Execution instance ID
    pub execution_id: String,

    /// Tenant that owns this execution
    pub tenant_id: String,

    /// Chain this execution runs
    pub chain_name: String,

    /// Current saga status
    pub status: SagaStatus,

    /// Start time
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// End time, set when a terminal status is reached
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Steps by step ID
    pub steps: HashMap<String, StepExecution>,

    /// Step IDs in the order they reached Success (compensation
    /// consumes this back-to-front)
    pub stack: Vec<String>,

    /// Operator-substituted input for the next step to start
    pub pending_input: Option<StepData>,

    /// Audit trail of operator actions
    pub decisions: Vec<DecisionRecord>,

    /// Cooperative cancellation flag, checked between steps
    pub cancel_requested: bool,
}

impl SagaExecution {
    /// Create a new running execution
    pub fn new(ctx: &TenantContext, chain_name: &str) -> Self {
        SagaExecution {
            execution_id: format!("saga-{}", uuid::Uuid::new_v4()),
            tenant_id: ctx.tenant_id.clone(),
            chain_name: chain_name.to_string(),
            status: SagaStatus::Running,
            started_at: chrono::Utc::now(),
            completed_at: None,
            steps: HashMap::new(),
            stack: Vec::new(),
            pending_input: None,
            decisions: Vec::new(),
            cancel_requested: false,
        }
    }

    /// Duration from start to completion, if terminal
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| end.signed_duration_since(self.started_at).num_milliseconds())
    }

    /// Compare-and-swap the status.
    ///
    /// Fails with `StatusConflict` and performs no mutation when the
    /// stored status differs from `expected`; fails with
    /// `InvalidTransition` when the transition table forbids the
    /// move. Must be called with the execution lock held.
    pub fn transition(&mut self, expected: SagaStatus, new: SagaStatus) -> Result<(), SagaError> {
        if self.status != expected {
            return Err(SagaError::StatusConflict(
                self.execution_id.clone(),
                expected,
                self.status,
            ));
        }
        if !expected.can_transition_to(new) {
            return Err(SagaError::InvalidTransition(expected, new));
        }

        log::debug!(
            "execution {} status {:?} -> {:?}",
            self.execution_id,
            expected,
            new
        );
        self.status = new;
        if new.is_terminal() {
            self.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    /// Get a step by ID
    pub fn step(&self, step_id: &str) -> Result<&StepExecution, SagaError> {
        self.steps.get(step_id).ok_or_else(|| {
            SagaError::UnknownStep(self.execution_id.clone(), step_id.to_string())
        })
    }

    /// Get a mutable step by ID
    pub fn step_mut(&mut self, step_id: &str) -> Result<&mut StepExecution, SagaError> {
        let execution_id = self.execution_id.clone();
        self.steps
            .get_mut(step_id)
            .ok_or_else(|| SagaError::UnknownStep(execution_id, step_id.to_string()))
    }

    /// Push a step onto the execution stack. Only steps that reached
    /// Success are ever pushed.
    pub fn push_stack(&mut self, step_id: &str) {
        self.stack.push(step_id.to_string());
    }

    /// Steps on the stack in chronological (push) order
    pub fn stack_steps(&self) -> Vec<&StepExecution> {
        self.stack
            .iter()
            .filter_map(|id| self.steps.get(id))
            .collect()
    }

    /// Step IDs still awaiting compensation, most recent first
    pub fn compensatable_step_ids(&self) -> Vec<String> {
        self.stack
            .iter()
            .rev()
            .filter(|id| {
                self.steps
                    .get(*id)
                    .map(|s| s.status == StepStatus::Success)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Whether every one of the chain's `chain_len` steps has
    /// finished forward execution (Success or Skipped)
    pub fn forward_complete(&self, chain_len: usize) -> bool {
        let done = self
            .steps
            .values()
            .filter(|s| matches!(s.status, StepStatus::Success | StepStatus::Skipped))
            .count();
        done >= chain_len
    }

    /// Append an operator action to the audit trail
    pub fn record_decision(&mut self, record: DecisionRecord) {
        self.decisions.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_execution() -> SagaExecution {
        SagaExecution::new(&TenantContext::new("tenant-1"), "OrderFlow")
    }

    #[test]
    fn test_transition_cas_semantics() {
        let mut execution = new_execution();

        // Stale expected status loses without mutating
        let err = execution
            .transition(SagaStatus::Compensating, SagaStatus::Compensated)
            .unwrap_err();
        assert!(matches!(err, SagaError::StatusConflict(_, _, _)));
        assert_eq!(execution.status, SagaStatus::Running);

        // Table-forbidden move is rejected even with a correct expected
        let err = execution
            .transition(SagaStatus::Running, SagaStatus::Compensated)
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidTransition(_, _)));
        assert_eq!(execution.status, SagaStatus::Running);

        execution
            .transition(SagaStatus::Running, SagaStatus::Completed)
            .unwrap();
        assert_eq!(execution.status, SagaStatus::Completed);
        assert!(execution.completed_at.is_some());
        assert!(execution.duration_ms().is_some());
    }

    #[test]
    fn test_compensatable_steps_reverse_order() {
        let mut execution = new_execution();

        for (step_id, component) in [("s1", "Reserve"), ("s2", "Charge"), ("s3", "Ship")] {
            let mut step = StepExecution::new(step_id, component, StepData::new());
            step.mark_success(StepData::new());
            execution.steps.insert(step_id.to_string(), step);
            execution.push_stack(step_id);
        }

        assert_eq!(execution.compensatable_step_ids(), vec!["s3", "s2", "s1"]);

        // A compensated step drops out of the compensatable view
        execution.step_mut("s3").unwrap().mark_compensated();
        assert_eq!(execution.compensatable_step_ids(), vec!["s2", "s1"]);
    }
}
