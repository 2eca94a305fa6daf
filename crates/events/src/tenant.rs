use scribe_core::TenantId;

use crate::JobUpdate;

/// Helper trait for tenant-scoped messages.
///
/// Consumers that serve a single tenant (a live connection, a tenant worker)
/// use this to reject messages belonging to other tenants.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for JobUpdate {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
