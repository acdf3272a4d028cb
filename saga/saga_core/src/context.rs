use serde::{Deserialize, Serialize};

/// Tenant context for an operation.
///
/// Passed explicitly through every orchestration call instead of
/// living in ambient/thread-local state, so concurrent workers can
/// service different tenants over the same shared stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Tenant that owns the execution
    pub tenant_id: String,
}

impl TenantContext {
    /// Create a new tenant context
    pub fn new(tenant_id: &str) -> Self {
        TenantContext {
            tenant_id: tenant_id.to_string(),
        }
    }
}
