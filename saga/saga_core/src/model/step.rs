use crate::types::StepStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque string-keyed payload passed into and out of steps
pub type StepData = HashMap<String, serde_json::Value>;

/// One step of a saga execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step ID, unique within the execution
    pub step_id: String,

    /// Component that ran (or will run) this step
    pub component_name: String,

    /// Input payload recorded at step start
    pub input_data: StepData,

    /// Output payload recorded at step success
    pub output_data: StepData,

    /// Step status
    pub status: StepStatus,

    /// Error code, set on failure
    pub error_code: Option<String>,

    /// Error message, set on failure
    pub error_message: Option<String>,

    /// Stack trace reported by the engine, set on failure
    pub stack_trace: Option<String>,

    /// Number of forward retries issued for this step
    pub retry_count: u32,

    /// Number of compensation attempts made for this step
    pub compensation_attempts: u32,

    /// Start time
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,

    /// End time (success, failure, or skip)
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Compensation start time
    pub compensation_started_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Compensation end time
    pub compensation_ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StepExecution {
    /// Create a new step in the Running state
    pub fn new(step_id: &str, component_name: &str, input_data: StepData) -> Self {
        StepExecution {
            step_id: step_id.to_string(),
            component_name: component_name.to_string(),
            input_data,
            output_data: StepData::new(),
            status: StepStatus::Running,
            error_code: None,
            error_message: None,
            stack_trace: None,
            retry_count: 0,
            compensation_attempts: 0,
            started_at: Some(chrono::Utc::now()),
            ended_at: None,
            compensation_started_at: None,
            compensation_ended_at: None,
        }
    }

    /// Mark the step as running (start of a retry cycle)
    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(chrono::Utc::now());
        self.ended_at = None;
    }

    /// Mark the step as successful
    pub fn mark_success(&mut self, output_data: StepData) {
        self.status = StepStatus::Success;
        self.output_data = output_data;
        self.error_code = None;
        self.error_message = None;
        self.stack_trace = None;
        self.ended_at = Some(chrono::Utc::now());
    }

    /// Mark the step as failed
    pub fn mark_failed(&mut self, error_code: &str, error_message: &str, stack_trace: Option<&str>) {
        self.status = StepStatus::Failed;
        self.error_code = Some(error_code.to_string());
        self.error_message = Some(error_message.to_string());
        self.stack_trace = stack_trace.map(str::to_string);
        self.ended_at = Some(chrono::Utc::now());
    }

    /// Mark the step as compensating
    pub fn mark_compensating(&mut self) {
        self.status = StepStatus::Compensating;
        self.compensation_started_at = Some(chrono::Utc::now());
    }

    /// Mark the step as compensated
    pub fn mark_compensated(&mut self) {
        self.status = StepStatus::Compensated;
        self.compensation_ended_at = Some(chrono::Utc::now());
    }

    /// Mark the step compensation as permanently failed
    pub fn mark_compensation_failed(&mut self, error: &str) {
        self.status = StepStatus::CompensationFailed;
        self.error_message = Some(error.to_string());
        self.compensation_ended_at = Some(chrono::Utc::now());
    }

    /// Mark the step as skipped
    pub fn mark_skipped(&mut self) {
        self.status = StepStatus::Skipped;
        self.ended_at = Some(chrono::Utc::now());
    }

    /// Reset the step to Pending so the engine can re-issue it.
    ///
    /// Clears failure fields; the retry counter is managed by the
    /// caller (incremented for policy retries, reset for a manual
    /// retry cycle).
    pub fn reset_for_retry(&mut self, new_input: Option<StepData>) {
        self.status = StepStatus::Pending;
        self.error_code = None;
        self.error_message = None;
        self.stack_trace = None;
        self.ended_at = None;
        if let Some(input) = new_input {
            self.input_data = input;
        }
    }

    /// Put a compensation-failed step back on the retryable stack
    /// with a fresh attempt budget
    pub fn reset_compensation(&mut self) {
        self.status = StepStatus::Success;
        self.compensation_attempts = 0;
        self.error_message = None;
        self.compensation_started_at = None;
        self.compensation_ended_at = None;
    }

    /// Increment the forward retry counter
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Increment the compensation attempt counter
    pub fn increment_compensation_attempts(&mut self) {
        self.compensation_attempts += 1;
    }
}
