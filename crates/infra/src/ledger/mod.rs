//! Resource ledger: per-tenant metered usage and quota checks.
//!
//! ## Guarantees
//!
//! - Recording is idempotent per `(job_id, resource kind)`: a completed job
//!   is billed exactly once even if completion is reported twice
//! - Per-tenant totals are updated atomically; concurrent completions never
//!   lose an increment
//! - Quotas are checked at admission; usage is recorded after completion

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::Serialize;

use scribe_core::{ResourceKind, TenantId, UsageRecord};

use crate::policy::TenantQuota;

pub use in_memory::InMemoryResourceLedger;
pub use postgres::PostgresResourceLedger;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("{resource} quota exceeded: used {used:.2} of {limit}")]
    QuotaExceeded {
        resource: &'static str,
        used: f64,
        limit: u64,
    },
    #[error("usage records must belong to a single tenant")]
    MixedTenants,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Usage totals for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub tenant_id: TenantId,
    /// Start of the current billing month (processing is metered monthly).
    pub period_start: DateTime<Utc>,
    pub processing_seconds: f64,
    /// All-time stored result size.
    pub storage_mb: f64,
    pub quota: TenantQuota,
}

impl UsageSummary {
    pub fn processing_minutes(&self) -> f64 {
        self.processing_seconds / 60.0
    }

    /// First quota this summary has used up, if any.
    pub fn exceeded(&self) -> Option<LedgerError> {
        if let Some(limit) = self.quota.processing_minutes {
            if self.processing_minutes() >= limit as f64 {
                return Some(LedgerError::QuotaExceeded {
                    resource: ResourceKind::Processing.as_str(),
                    used: self.processing_minutes(),
                    limit,
                });
            }
        }
        if let Some(limit) = self.quota.storage_mb {
            if self.storage_mb >= limit as f64 {
                return Some(LedgerError::QuotaExceeded {
                    resource: ResourceKind::Storage.as_str(),
                    used: self.storage_mb,
                    limit,
                });
            }
        }
        None
    }
}

/// Resource ledger abstraction.
#[async_trait]
pub trait ResourceLedger: Send + Sync {
    /// Current usage totals.
    async fn summary(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<UsageSummary, LedgerError>;

    /// Record usage for one tenant. Returns how many records were new.
    async fn record_usage(&self, records: &[UsageRecord]) -> Result<usize, LedgerError>;

    /// Fails with `QuotaExceeded` if the tenant has used up a quota.
    async fn check_quota(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<UsageSummary, LedgerError> {
        let summary = self.summary(tenant_id, now).await?;
        match summary.exceeded() {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .unwrap_or_else(|| now.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc()
}

fn single_tenant(records: &[UsageRecord]) -> Result<Option<TenantId>, LedgerError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    if records.iter().any(|r| r.tenant_id != first.tenant_id) {
        return Err(LedgerError::MixedTenants);
    }
    Ok(Some(first.tenant_id))
}
