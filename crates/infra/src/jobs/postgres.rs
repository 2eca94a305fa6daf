//! Postgres-backed job store.
//!
//! ## Atomic transitions
//!
//! `transition()` runs in a transaction:
//! 1. Lock the row (`SELECT ... FOR UPDATE`)
//! 2. Apply the transition with the domain state machine
//! 3. Write the new state back
//!
//! Concurrent writers serialize on the row lock; the loser re-reads the
//! winner's state and is rejected by the state machine.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Anything else | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use scribe_core::{Job, JobId, JobStatus, JobType, Priority, TenantId, Transition, UserId, WorkflowId};

use super::store::{JobFilter, JobStore, JobStoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_jobs_and_usage.sql");

const JOB_COLUMNS: &str = "id, tenant_id, user_id, workflow_id, job_type, status, priority, \
     input_location, result_location, error, retry_of, created_at, updated_at, completed_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    ///
    /// Also covers the usage table used by [`crate::ledger::PostgresResourceLedger`].
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e, None))?;
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e, Some(job_id)))?;
        row.map(|r| JobRow::from_pg(&r)?.try_into()).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id), err)]
    async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, user_id, workflow_id, job_type, status, priority,
                input_location, result_location, error, retry_of,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.tenant_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.workflow_id.map(|w| *w.as_uuid()))
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(i16::from(job.priority.value()))
        .bind(&job.input_location)
        .bind(&job.result_location)
        .bind(&job.error)
        .bind(job.retry_of.map(|j| *j.as_uuid()))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", e, Some(job.id)))?;
        Ok(job)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.fetch(job_id).await? {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job)),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, transition), fields(to = %transition.target()), err)]
    async fn transition(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        transition: Transition,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("transition", e, Some(job_id)))?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("transition", e, Some(job_id)))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job: Job = JobRow::from_pg(&row)?.try_into()?;
        if job.tenant_id != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }
        let current = job.status;
        job.apply(transition, Utc::now())
            .map_err(|source| JobStoreError::Transition {
                job_id,
                current,
                source,
            })?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, result_location = $3, error = $4, updated_at = $5, completed_at = $6
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.result_location)
        .bind(&job.error)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("transition", e, Some(job_id)))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("transition", e, Some(job_id)))?;
        Ok(job)
    }

    async fn list(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = $1
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::UUID IS NULL OR user_id = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.user_id.map(|u| *u.as_uuid()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e, None))?;

        rows.iter()
            .map(|r| JobRow::from_pg(r)?.try_into())
            .collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('queued', 'processing') ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unfinished", e, None))?;

        rows.iter()
            .map(|r| JobRow::from_pg(r)?.try_into())
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error, job_id: Option<JobId>) -> JobStoreError {
    match (&err, job_id) {
        (sqlx::Error::Database(db_err), Some(job_id)) if db_err.code().as_deref() == Some("23505") => {
            JobStoreError::AlreadyExists(job_id)
        }
        _ => JobStoreError::Storage(format!("{operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    user_id: uuid::Uuid,
    workflow_id: Option<uuid::Uuid>,
    job_type: String,
    status: String,
    priority: i16,
    input_location: String,
    result_location: Option<String>,
    error: Option<String>,
    retry_of: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn from_pg(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job row: {e}"));
        Ok(JobRow {
            id: row.try_get("id").map_err(read)?,
            tenant_id: row.try_get("tenant_id").map_err(read)?,
            user_id: row.try_get("user_id").map_err(read)?,
            workflow_id: row.try_get("workflow_id").map_err(read)?,
            job_type: row.try_get("job_type").map_err(read)?,
            status: row.try_get("status").map_err(read)?,
            priority: row.try_get("priority").map_err(read)?,
            input_location: row.try_get("input_location").map_err(read)?,
            result_location: row.try_get("result_location").map_err(read)?,
            error: row.try_get("error").map_err(read)?,
            retry_of: row.try_get("retry_of").map_err(read)?,
            created_at: row.try_get("created_at").map_err(read)?,
            updated_at: row.try_get("updated_at").map_err(read)?,
            completed_at: row.try_get("completed_at").map_err(read)?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |e: scribe_core::DomainError| JobStoreError::Storage(format!("corrupt job row {id}: {e}"));
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            user_id: UserId::from_uuid(row.user_id),
            workflow_id: row.workflow_id.map(WorkflowId::from_uuid),
            job_type: JobType::new(row.job_type).map_err(corrupt)?,
            status: row.status.parse::<JobStatus>().map_err(corrupt)?,
            priority: Priority::new(i64::from(row.priority)).map_err(corrupt)?,
            input_location: row.input_location,
            result_location: row.result_location,
            error: row.error,
            retry_of: row.retry_of.map(JobId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}
