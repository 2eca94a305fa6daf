//! Status update message pushed to live subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use scribe_core::{Fingerprint, Job, JobId, JobStatus, TenantId, UserId};

/// A job status change (or an intermediate progress report).
///
/// Built from a persisted [`Job`] so that anything a subscriber observes can be
/// read back from the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub status: JobStatus,
    /// `{"path"}` once completed, `{"error"}` once failed/canceled,
    /// `{"progress"}` for progress reports.
    pub result: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl JobUpdate {
    /// Snapshot of the job's persisted state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            tenant_id: job.tenant_id,
            user_id: job.user_id,
            job_id: job.id,
            status: job.status,
            result: result_payload(job),
            updated_at: job.updated_at,
            fingerprint: job.fingerprint(),
        }
    }

    /// Intermediate progress for a job that is `processing`.
    ///
    /// Progress is not persisted; it carries the fingerprint of the underlying
    /// persisted state.
    pub fn progress(job: &Job, percent: u8) -> Self {
        Self {
            result: Some(json!({ "progress": percent.min(100) })),
            ..Self::from_job(job)
        }
    }

    pub fn is_progress(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get("progress"))
            .is_some()
    }
}

/// Client-facing result payload for a job's current state.
pub fn result_payload(job: &Job) -> Option<JsonValue> {
    match job.status {
        JobStatus::Completed => job
            .result_location
            .as_ref()
            .map(|path| json!({ "path": path })),
        JobStatus::Failed | JobStatus::Canceled => {
            job.error.as_ref().map(|error| json!({ "error": error }))
        }
        JobStatus::Queued | JobStatus::Processing => None,
    }
}
