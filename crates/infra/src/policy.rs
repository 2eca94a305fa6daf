//! Per-tenant limits and quotas.
//!
//! Limits bound scheduling (how many jobs a tenant may have in flight and
//! waiting); quotas bound metered consumption. Both are looked up on every
//! admission so changes apply without restarting queues.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use scribe_core::TenantId;

/// Scheduling limits for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TenantLimits {
    /// Upper bound on concurrently running jobs (worker loops).
    pub max_concurrent_jobs: usize,
    /// Admission ceiling: queued plus in-flight jobs.
    pub max_queued_jobs: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            max_queued_jobs: 100,
        }
    }
}

/// Metered consumption allowance. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TenantQuota {
    /// Processing minutes per calendar month.
    pub processing_minutes: Option<u64>,
    /// Total stored result size, in MB.
    pub storage_mb: Option<u64>,
}

/// Source of tenant limits and quotas.
pub trait TenantPolicy: Send + Sync {
    fn limits(&self, tenant_id: TenantId) -> TenantLimits;
    fn quota(&self, tenant_id: TenantId) -> TenantQuota;
}

/// Process-local policy: defaults plus explicit per-tenant overrides.
#[derive(Debug, Default)]
pub struct StaticTenantPolicy {
    default_limits: TenantLimits,
    default_quota: TenantQuota,
    limits: RwLock<HashMap<TenantId, TenantLimits>>,
    quotas: RwLock<HashMap<TenantId, TenantQuota>>,
}

impl StaticTenantPolicy {
    pub fn new(default_limits: TenantLimits, default_quota: TenantQuota) -> Self {
        Self {
            default_limits,
            default_quota,
            limits: RwLock::new(HashMap::new()),
            quotas: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_limits(&self, tenant_id: TenantId, limits: TenantLimits) {
        self.limits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, limits);
    }

    pub fn set_quota(&self, tenant_id: TenantId, quota: TenantQuota) {
        self.quotas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, quota);
    }
}

impl TenantPolicy for StaticTenantPolicy {
    fn limits(&self, tenant_id: TenantId) -> TenantLimits {
        let limits = self
            .limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.default_limits);

        // A tenant always gets at least one worker and one slot.
        TenantLimits {
            max_concurrent_jobs: limits.max_concurrent_jobs.max(1),
            max_queued_jobs: limits.max_queued_jobs.max(1),
        }
    }

    fn quota(&self, tenant_id: TenantId) -> TenantQuota {
        self.quotas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .copied()
            .unwrap_or(self.default_quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_per_tenant() {
        let policy = StaticTenantPolicy::default();
        let a = TenantId::new();
        let b = TenantId::new();

        policy.set_limits(
            a,
            TenantLimits {
                max_concurrent_jobs: 4,
                max_queued_jobs: 2,
            },
        );

        assert_eq!(policy.limits(a).max_concurrent_jobs, 4);
        assert_eq!(policy.limits(b), TenantLimits::default());
        assert_eq!(policy.quota(b), TenantQuota::default());
    }

    #[test]
    fn zero_limits_are_clamped() {
        let policy = StaticTenantPolicy::new(
            TenantLimits {
                max_concurrent_jobs: 0,
                max_queued_jobs: 0,
            },
            TenantQuota::default(),
        );
        let limits = policy.limits(TenantId::new());
        assert_eq!(limits.max_concurrent_jobs, 1);
        assert_eq!(limits.max_queued_jobs, 1);
    }
}
