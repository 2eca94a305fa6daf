use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scribe_core::{Job, JobId, JobStatus, JobType, Priority, TenantId, UserId, WorkflowId};
use scribe_infra::jobs::{JobFilter, SubmitJob};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub workflow_id: Option<String>,
    pub input_location: String,
    pub priority: Option<i64>,
    pub job_type: Option<String>,
}

impl CreateJobRequest {
    pub fn into_submit(self) -> Result<SubmitJob, axum::response::Response> {
        let workflow_id = self
            .workflow_id
            .as_deref()
            .map(|raw| parse_id::<WorkflowId>(raw, "workflow_id"))
            .transpose()?;
        Ok(SubmitJob {
            workflow_id,
            input_location: self.input_location,
            priority: self.priority,
            job_type: self.job_type,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<JobFilter, axum::response::Response> {
        let mut filter = JobFilter::default();
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            let status: JobStatus = status
                .parse()
                .map_err(|e: scribe_core::DomainError| errors::json_error(StatusCode::BAD_REQUEST, "validation", e.to_string()))?;
            filter = filter.with_status(status);
        }
        let defaults = JobFilter::default();
        Ok(filter.page(
            self.limit.unwrap_or(defaults.limit),
            self.offset.unwrap_or(defaults.offset),
        ))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Fallback for clients that cannot send `If-None-Match`.
    pub etag: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workflow_id: Option<WorkflowId>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: Priority,
    pub input_location: String,
    pub result_location: Option<String>,
    pub error: Option<String>,
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let fingerprint = job.fingerprint().to_string();
        Self {
            id: job.id,
            tenant_id: job.tenant_id,
            user_id: job.user_id,
            workflow_id: job.workflow_id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            input_location: job.input_location,
            result_location: job.result_location,
            error: job.error,
            retry_of: job.retry_of,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            fingerprint,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub tenant_id: TenantId,
    pub queue_length: usize,
    pub in_flight: usize,
    pub workers: usize,
    /// Only reported to admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_tenants: Option<usize>,
}

pub fn parse_id<T: core::str::FromStr>(raw: &str, what: &str) -> Result<T, axum::response::Response> {
    raw.parse().map_err(|_| {
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid {what}: {raw}"),
        )
    })
}
