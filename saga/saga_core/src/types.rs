use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for saga orchestration
#[derive(Error, Debug)]
pub enum SagaError {
    #[error("duplicate step {1} for execution {0}")]
    DuplicateStep(String, String),

    #[error("unknown execution: {0}")]
    UnknownExecution(String),

    #[error("unknown step {1} for execution {0}")]
    UnknownStep(String, String),

    #[error("no metadata registered for component: {0}")]
    UnknownComponent(String),

    #[error("no chain definition registered for: {0}")]
    UnknownChain(String),

    #[error("status conflict on {0}: expected {1:?}, found {2:?}")]
    StatusConflict(String, SagaStatus, SagaStatus),

    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(SagaStatus, SagaStatus),

    #[error("decision rejected for {0}: saga is {1:?}, not WaitingManualDecision")]
    InvalidDecisionState(String, SagaStatus),

    #[error("compensation exhausted for step {1} of execution {0}")]
    CompensationExhausted(String, String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("other error: {0}")]
    Other(String),
}

/// Saga execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga is executing forward steps
    Running,

    /// Saga is parked waiting for an operator decision
    WaitingManualDecision,

    /// Saga is unwinding its execution stack
    Compensating,

    /// A compensating action permanently failed; operator must intervene
    CompensationFailed,

    /// All steps completed (terminal)
    Completed,

    /// Saga failed without compensation (terminal)
    Failed,

    /// All stacked steps were compensated (terminal)
    Compensated,

    /// Saga was cancelled by an operator (terminal)
    Cancelled,
}

impl SagaStatus {
    /// Check if this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::Compensated
                | SagaStatus::Cancelled
        )
    }

    /// Check whether the transition table permits `self -> to`.
    ///
    /// Cancellation is allowed from any non-terminal state; everything
    /// else follows the fixed table.
    pub fn can_transition_to(&self, to: SagaStatus) -> bool {
        if to == SagaStatus::Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, to),
            (SagaStatus::Running, SagaStatus::Completed)
                | (SagaStatus::Running, SagaStatus::Failed)
                | (SagaStatus::Running, SagaStatus::Compensating)
                | (SagaStatus::Running, SagaStatus::WaitingManualDecision)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
                | (SagaStatus::Compensating, SagaStatus::CompensationFailed)
                | (SagaStatus::WaitingManualDecision, SagaStatus::Running)
                | (SagaStatus::WaitingManualDecision, SagaStatus::Compensating)
                | (SagaStatus::CompensationFailed, SagaStatus::Compensating)
        )
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step created (or reset for retry) but not yet started
    Pending,

    /// Step is running in the workflow engine
    Running,

    /// Step completed and was pushed onto the execution stack
    Success,

    /// Step failed
    Failed,

    /// Step compensation is running
    Compensating,

    /// Step compensation completed
    Compensated,

    /// Step compensation permanently failed
    CompensationFailed,

    /// Step was skipped by policy or operator
    Skipped,
}

/// Action resolved for a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Unwind previously successful steps in reverse order
    AutoCompensate,

    /// Re-issue the failed step, bounded by the rule's retry ceiling
    Retry,

    /// Skip the failed step and continue forward
    Skip,

    /// Park the saga for an operator decision
    ManualDecision,

    /// Fail the saga immediately, no compensation
    FailFast,
}

/// Verdict applied after a step failure.
///
/// Returned to the reporting engine so it knows what the saga did
/// with the failure (re-issue the step, stop sending events, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Step was reset to pending; the engine should re-issue it
    Retry { attempt: u32, max: u32 },

    /// Saga moved to Compensating; the stack will be drained
    Compensate,

    /// Step was skipped; the engine should continue with the next step
    Skip,

    /// Saga parked in WaitingManualDecision
    ManualDecision,

    /// Saga failed without compensation
    FailFast,
}

/// Configuration for the saga coordinator
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Ceiling on compensation attempts per step
    pub max_compensation_attempts: u32,

    /// Fixed delay between compensation attempts
    pub compensation_retry_delay_ms: u64,

    /// Timeout applied when a component's metadata has none
    pub default_timeout_ms: u64,

    /// Check interval for the step timeout monitor
    pub check_interval_ms: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        SagaConfig {
            max_compensation_attempts: 3,
            compensation_retry_delay_ms: 1000, // 1 second
            default_timeout_ms: 30000,         // 30 seconds
            check_interval_ms: 1000,           // 1 second
        }
    }
}
