//! Failure policy resolution for failed steps

use crate::model::MetadataRegistry;
use crate::types::{ActionType, FailureVerdict, SagaError};
use std::sync::Arc;

/// Resolves a failed step's error code against the component's
/// failure rules.
///
/// Rules are scanned in declaration order, first exact match wins;
/// when none matches the component's default strategy applies. A
/// Retry resolution whose ceiling the step has already reached
/// degrades to ManualDecision instead of looping forever.
pub struct FailurePolicyResolver {
    /// Shared read-only component metadata
    registry: Arc<MetadataRegistry>,
}

impl FailurePolicyResolver {
    /// Create a resolver over a metadata registry
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        FailurePolicyResolver { registry }
    }

    /// Resolve the verdict for a failed step.
    ///
    /// `current_retry_count` is the number of retries already issued
    /// for the step. An AutoCompensate resolution proceeds even when
    /// the failed component itself has nothing to undo; compensation
    /// targets the stack of previously successful steps, never the
    /// failed step.
    pub fn resolve(
        &self,
        component_name: &str,
        error_code: &str,
        current_retry_count: u32,
    ) -> Result<FailureVerdict, SagaError> {
        let metadata = self.registry.component(component_name)?;

        let (action, retry_ceiling) = match metadata.matching_rule(error_code) {
            Some(rule) => (rule.action, rule.retry_count),
            None => (metadata.default_failure_strategy, 0),
        };

        let verdict = match action {
            ActionType::Retry => {
                if current_retry_count >= retry_ceiling {
                    log::debug!(
                        "retries exhausted for {} on {} ({}/{}), escalating to manual decision",
                        error_code,
                        component_name,
                        current_retry_count,
                        retry_ceiling
                    );
                    FailureVerdict::ManualDecision
                } else {
                    FailureVerdict::Retry {
                        attempt: current_retry_count + 1,
                        max: retry_ceiling,
                    }
                }
            }
            ActionType::AutoCompensate => FailureVerdict::Compensate,
            ActionType::Skip => FailureVerdict::Skip,
            ActionType::ManualDecision => FailureVerdict::ManualDecision,
            ActionType::FailFast => FailureVerdict::FailFast,
        };

        log::debug!(
            "resolved {} on {} -> {:?}",
            error_code,
            component_name,
            verdict
        );
        Ok(verdict)
    }
}
