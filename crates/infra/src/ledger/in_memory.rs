use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scribe_core::{JobId, ResourceKind, TenantId, UsageRecord};

use super::{LedgerError, ResourceLedger, UsageSummary, month_start, single_tenant};
use crate::policy::TenantPolicy;

#[derive(Debug, Default)]
struct TenantUsage {
    records: Vec<UsageRecord>,
    recorded: HashSet<(JobId, ResourceKind)>,
}

/// In-memory ledger for tests/dev.
///
/// Each tenant's usage sits behind its own lock, so recording for one tenant
/// never waits on another.
pub struct InMemoryResourceLedger {
    tenants: RwLock<HashMap<TenantId, Arc<Mutex<TenantUsage>>>>,
    policy: Arc<dyn TenantPolicy>,
}

impl InMemoryResourceLedger {
    pub fn new(policy: Arc<dyn TenantPolicy>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Every record accepted for a tenant, in recording order.
    pub fn records(&self, tenant_id: TenantId) -> Vec<UsageRecord> {
        self.usage_for(tenant_id)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }

    fn usage_for(&self, tenant_id: TenantId) -> Arc<Mutex<TenantUsage>> {
        if let Some(usage) = self
            .tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
        {
            return Arc::clone(usage);
        }
        Arc::clone(
            self.tenants
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(tenant_id)
                .or_default(),
        )
    }
}

impl core::fmt::Debug for InMemoryResourceLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryResourceLedger").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceLedger for InMemoryResourceLedger {
    async fn summary(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<UsageSummary, LedgerError> {
        let period_start = month_start(now);
        let usage = self.usage_for(tenant_id);
        let usage = usage.lock().unwrap_or_else(PoisonError::into_inner);

        let mut processing_seconds = 0.0;
        let mut storage_mb = 0.0;
        for record in &usage.records {
            match record.kind {
                ResourceKind::Processing if record.recorded_at >= period_start => {
                    processing_seconds += record.amount
                }
                ResourceKind::Processing => {}
                ResourceKind::Storage => storage_mb += record.amount,
            }
        }

        Ok(UsageSummary {
            tenant_id,
            period_start,
            processing_seconds,
            storage_mb,
            quota: self.policy.quota(tenant_id),
        })
    }

    async fn record_usage(&self, records: &[UsageRecord]) -> Result<usize, LedgerError> {
        let Some(tenant_id) = single_tenant(records)? else {
            return Ok(0);
        };

        let usage = self.usage_for(tenant_id);
        let mut usage = usage.lock().unwrap_or_else(PoisonError::into_inner);
        let mut written = 0;
        for record in records {
            if usage.recorded.insert((record.job_id, record.kind)) {
                usage.records.push(record.clone());
                written += 1;
            }
        }
        Ok(written)
    }
}
