use crate::types::{ActionType, SagaError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Failure rule for a component.
///
/// Rules are scanned in declaration order; the first rule whose
/// condition matches the failed step's error code wins. Matching is
/// an exact error-code comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRule {
    /// Error code this rule matches
    pub condition: String,

    /// Action to take when the rule matches
    pub action: ActionType,

    /// Retry ceiling, used only when action is Retry
    pub retry_count: u32,
}

impl FailureRule {
    /// Create a rule for a non-retry action
    pub fn new(condition: &str, action: ActionType) -> Self {
        FailureRule {
            condition: condition.to_string(),
            action,
            retry_count: 0,
        }
    }

    /// Create a retry rule with a ceiling
    pub fn retry(condition: &str, retry_count: u32) -> Self {
        FailureRule {
            condition: condition.to_string(),
            action: ActionType::Retry,
            retry_count,
        }
    }

    /// Check whether this rule matches an error code
    pub fn matches(&self, error_code: &str) -> bool {
        self.condition == error_code
    }
}

/// Static saga metadata for one component type.
///
/// Immutable configuration shared read-only across all executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaMetadata {
    /// Component this metadata describes
    pub component_name: String,

    /// Name of the compensating action, empty if none
    pub compensate_component: String,

    /// Whether a successful run of this component must be undone
    pub needs_compensation: bool,

    /// Strategy applied when no failure rule matches
    pub default_failure_strategy: ActionType,

    /// Timeout for step and compensation attempts
    pub timeout_ms: u64,

    /// Ordered failure rules, first match wins
    pub failure_rules: Vec<FailureRule>,
}

impl SagaMetadata {
    /// Create metadata with no compensation and a fail-fast default
    pub fn new(component_name: &str) -> Self {
        SagaMetadata {
            component_name: component_name.to_string(),
            compensate_component: String::new(),
            needs_compensation: false,
            default_failure_strategy: ActionType::FailFast,
            timeout_ms: 30000, // 30 seconds
            failure_rules: Vec::new(),
        }
    }

    /// Set the compensating component
    pub fn with_compensation(mut self, compensate_component: &str) -> Self {
        self.compensate_component = compensate_component.to_string();
        self.needs_compensation = true;
        self
    }

    /// Set the default failure strategy
    pub fn with_default_strategy(mut self, strategy: ActionType) -> Self {
        self.default_failure_strategy = strategy;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Append a failure rule
    pub fn with_rule(mut self, rule: FailureRule) -> Self {
        self.failure_rules.push(rule);
        self
    }

    /// Check if the component has a registered compensating action
    pub fn has_compensation(&self) -> bool {
        !self.compensate_component.is_empty()
    }

    /// Find the first rule matching an error code
    pub fn matching_rule(&self, error_code: &str) -> Option<&FailureRule> {
        self.failure_rules.iter().find(|r| r.matches(error_code))
    }
}

/// Ordered chain of components making up one saga type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    /// Chain name
    pub name: String,

    /// Components in execution order
    pub components: Vec<String>,
}

impl ChainDefinition {
    /// Create a new chain definition
    pub fn new(name: &str, components: Vec<&str>) -> Self {
        ChainDefinition {
            name: name.to_string(),
            components: components.into_iter().map(str::to_string).collect(),
        }
    }

    /// Number of steps in the chain
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the chain has no components
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Registry of component metadata and chain definitions.
///
/// Built once at startup and shared read-only; lookups never need a
/// lock.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    /// Metadata by component name
    components: HashMap<String, SagaMetadata>,

    /// Chain definitions by chain name
    chains: HashMap<String, ChainDefinition>,
}

impl MetadataRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register component metadata
    pub fn register_component(&mut self, metadata: SagaMetadata) {
        self.components
            .insert(metadata.component_name.clone(), metadata);
    }

    /// Register a chain definition
    pub fn register_chain(&mut self, chain: ChainDefinition) {
        self.chains.insert(chain.name.clone(), chain);
    }

    /// Look up metadata for a component
    pub fn component(&self, component_name: &str) -> Result<&SagaMetadata, SagaError> {
        self.components
            .get(component_name)
            .ok_or_else(|| SagaError::UnknownComponent(component_name.to_string()))
    }

    /// Look up a chain definition
    pub fn chain(&self, chain_name: &str) -> Result<&ChainDefinition, SagaError> {
        self.chains
            .get(chain_name)
            .ok_or_else(|| SagaError::UnknownChain(chain_name.to_string()))
    }
}
