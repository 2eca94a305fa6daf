//! Postgres-backed resource ledger.
//!
//! Idempotency rests on the `UNIQUE (job_id, resource_kind)` constraint:
//! duplicate reports are dropped with `ON CONFLICT DO NOTHING`. Totals are
//! aggregated on read, so there is no counter row to race on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use scribe_core::{TenantId, UsageRecord};

use super::{LedgerError, ResourceLedger, UsageSummary, month_start, single_tenant};
use crate::policy::TenantPolicy;

#[derive(Clone)]
pub struct PostgresResourceLedger {
    pool: Arc<PgPool>,
    policy: Arc<dyn TenantPolicy>,
}

impl PostgresResourceLedger {
    /// Expects the schema created by [`crate::jobs::PostgresJobStore::ensure_schema`].
    pub fn new(pool: PgPool, policy: Arc<dyn TenantPolicy>) -> Self {
        Self {
            pool: Arc::new(pool),
            policy,
        }
    }
}

impl core::fmt::Debug for PostgresResourceLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresResourceLedger").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceLedger for PostgresResourceLedger {
    async fn summary(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<UsageSummary, LedgerError> {
        let period_start = month_start(now);
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(amount) FILTER (WHERE resource_kind = 'processing' AND recorded_at >= $2), 0) AS processing_seconds,
                COALESCE(SUM(amount) FILTER (WHERE resource_kind = 'storage'), 0) AS storage_mb
            FROM resource_usage
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(period_start)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| LedgerError::Storage(format!("summary: {e}")))?;

        let read = |e: sqlx::Error| LedgerError::Storage(format!("failed to read usage row: {e}"));
        Ok(UsageSummary {
            tenant_id,
            period_start,
            processing_seconds: row.try_get("processing_seconds").map_err(read)?,
            storage_mb: row.try_get("storage_mb").map_err(read)?,
            quota: self.policy.quota(tenant_id),
        })
    }

    #[instrument(skip(self, records), fields(records = records.len()), err)]
    async fn record_usage(&self, records: &[UsageRecord]) -> Result<usize, LedgerError> {
        if single_tenant(records)?.is_none() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Storage(format!("record_usage: {e}")))?;

        let mut written = 0;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO resource_usage (tenant_id, user_id, job_id, resource_kind, amount, unit, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (job_id, resource_kind) DO NOTHING
                "#,
            )
            .bind(record.tenant_id.as_uuid())
            .bind(record.user_id.as_uuid())
            .bind(record.job_id.as_uuid())
            .bind(record.kind.as_str())
            .bind(record.amount)
            .bind(record.unit.as_str())
            .bind(record.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| LedgerError::Storage(format!("record_usage: {e}")))?;
            written += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::Storage(format!("record_usage: {e}")))?;
        Ok(written)
    }
}
