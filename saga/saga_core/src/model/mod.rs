//! Data model for saga executions, steps, and static component metadata

pub mod decision;
pub mod execution;
pub mod metadata;
pub mod step;

// Re-exports
pub use decision::{Decision, DecisionRecord, ManualDecision, OperatorAction};
pub use execution::SagaExecution;
pub use metadata::{ChainDefinition, FailureRule, MetadataRegistry, SagaMetadata};
pub use step::{StepData, StepExecution};
