//! Saga Execution and Compensation Orchestrator
//!
//! This crate tracks the progress of multi-step business transactions
//! (sagas), and when a step fails it decides and drives the recovery:
//! retry the step, run registered compensations in reverse order of
//! execution, skip the step, park the saga for a human operator, or
//! fail fast.
//!
//! # Features
//!
//! - Step ledger: append-only record of step start/success/failure
//!   with a chronological stack of successful steps
//! - CAS state store: every saga status move is a compare-and-swap
//!   against an expected status, so concurrent triggers cannot
//!   double-apply recovery
//! - Failure policy resolver: per-component rules mapping error codes
//!   to actions, with retry ceilings that escalate to an operator
//! - Compensation orchestrator: LIFO drain of the execution stack
//!   with bounded, timed attempts per step
//! - Manual decision gateway: CONTINUE / RETRY / COMPENSATE operator
//!   decisions for parked sagas, plus cooperative cancellation
//!
//! # Getting Started
//!
//! ```rust,no_run
//! use saga_core::model::{ChainDefinition, FailureRule, MetadataRegistry, SagaMetadata, StepData};
//! use saga_core::types::{ActionType, SagaConfig};
//! use saga_core::{SagaCoordinator, TenantContext};
//! use std::sync::Arc;
//!
//! let mut registry = MetadataRegistry::new();
//! registry.register_chain(ChainDefinition::new("OrderFlow", vec!["Reserve", "Charge"]));
//! registry.register_component(
//!     SagaMetadata::new("Reserve").with_compensation("ReleaseReserve"),
//! );
//! registry.register_component(
//!     SagaMetadata::new("Charge")
//!         .with_compensation("RefundCharge")
//!         .with_rule(FailureRule::new("CARD_DECLINED", ActionType::AutoCompensate)),
//! );
//!
//! let coordinator = Arc::new(SagaCoordinator::new(Arc::new(registry), SagaConfig::default()));
//! let ctx = TenantContext::new("tenant-1");
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     coordinator.start().await.unwrap();
//!
//!     let execution_id = coordinator.begin_chain(&ctx, "OrderFlow").await.unwrap();
//!     coordinator
//!         .on_step_start(&ctx, &execution_id, "s1", "Reserve", StepData::new())
//!         .await
//!         .unwrap();
//!     coordinator
//!         .on_step_success(&ctx, &execution_id, "s1", StepData::new())
//!         .await
//!         .unwrap();
//! });
//! ```

/// Core model types: executions, steps, metadata, decisions
pub mod model;

/// Saga state store with CAS status transitions and persistence
pub mod store;

/// Step lifecycle ledger and execution stack
pub mod ledger;

/// Failure policy resolution
pub mod policy;

/// Reverse-order compensation
pub mod compensation;

/// Operator decision surface
pub mod decision;

/// Coordinator facade
pub mod coordinator;

/// Tenant scoping
pub mod context;

/// Status enums, errors, and configuration
pub mod types;

// Re-export important types
pub use compensation::{CompensationHandler, CompensationOrchestrator};
pub use context::TenantContext;
pub use coordinator::SagaCoordinator;
pub use decision::ManualDecisionGateway;
pub use ledger::StepLedger;
pub use model::{
    ChainDefinition, Decision, DecisionRecord, FailureRule, ManualDecision, MetadataRegistry,
    SagaExecution, SagaMetadata, StepData, StepExecution,
};
pub use policy::FailurePolicyResolver;
pub use store::{FileStorage, MemoryStorage, SagaStateStore, StorageBackend};
pub use types::{ActionType, FailureVerdict, SagaConfig, SagaError, SagaStatus, StepStatus};

/// Error types from across the orchestrator
pub mod error {
    pub use crate::types::SagaError;
}

#[cfg(test)]
pub mod integration_tests;
