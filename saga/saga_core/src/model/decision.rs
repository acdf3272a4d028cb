use crate::model::step::StepData;
use serde::{Deserialize, Serialize};

/// Operator decision for a parked saga
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Skip the failed step and resume forward execution
    Continue,

    /// Unwind the execution stack
    Compensate,

    /// Re-issue the failed step
    Retry,
}

/// An operator's out-of-band decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualDecision {
    /// The decision
    pub decision: Decision,

    /// Operator identity, recorded for audit
    pub operator: String,

    /// Free-form reason
    pub reason: String,

    /// Replacement input for the retried or following step
    pub modified_data: Option<StepData>,
}

impl ManualDecision {
    /// Create a new manual decision
    pub fn new(decision: Decision, operator: &str, reason: &str) -> Self {
        ManualDecision {
            decision,
            operator: operator.to_string(),
            reason: reason.to_string(),
            modified_data: None,
        }
    }

    /// Attach replacement input data
    pub fn with_modified_data(mut self, data: StepData) -> Self {
        self.modified_data = Some(data);
        self
    }
}

/// Operator action recorded against an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorAction {
    Continue,
    Compensate,
    Retry,
    SkipStep,
    RetryCompensation,
    Cancel,
}

impl From<Decision> for OperatorAction {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Continue => OperatorAction::Continue,
            Decision::Compensate => OperatorAction::Compensate,
            Decision::Retry => OperatorAction::Retry,
        }
    }
}

/// Audit record of one operator action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// What the operator did
    pub action: OperatorAction,

    /// Operator identity
    pub operator: String,

    /// Free-form reason
    pub reason: String,

    /// When the action was accepted
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

impl DecisionRecord {
    /// Create a record stamped with the current time
    pub fn new(action: OperatorAction, operator: &str, reason: &str) -> Self {
        DecisionRecord {
            action,
            operator: operator.to_string(),
            reason: reason.to_string(),
            decided_at: chrono::Utc::now(),
        }
    }
}
