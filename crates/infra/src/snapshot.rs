//! Conditional status reads for clients that poll instead of subscribing.
//!
//! Read-only: this path never mutates a job and may be served from a replica
//! of the job store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use scribe_auth::{Identity, authorize_job_access};
use scribe_core::{Fingerprint, Job, JobId, JobStatus};
use scribe_events::update::result_payload;

use crate::jobs::{JobError, JobStore};

/// Client-facing status body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            result: result_payload(job),
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusSnapshot {
    /// The caller's fingerprint is current; keep the cached copy.
    NotModified { fingerprint: Fingerprint },
    Modified {
        view: JobStatusView,
        fingerprint: Fingerprint,
    },
}

impl StatusSnapshot {
    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            StatusSnapshot::NotModified { fingerprint } | StatusSnapshot::Modified { fingerprint, .. } => fingerprint,
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, StatusSnapshot::Modified { .. })
    }
}

#[derive(Clone)]
pub struct StatusSnapshotService {
    store: Arc<dyn JobStore>,
}

impl StatusSnapshotService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Load the job and compare its fingerprint with `prior` (an
    /// `If-None-Match` value or a bare fingerprint).
    pub async fn get_status(
        &self,
        identity: &Identity,
        job_id: JobId,
        prior: Option<&str>,
    ) -> Result<StatusSnapshot, JobError> {
        let job = self
            .store
            .get(identity.tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        authorize_job_access(identity, &job)?;

        let fingerprint = job.fingerprint();
        if prior.is_some_and(|token| fingerprint.matches(token)) {
            debug!(%job_id, %fingerprint, "status not modified");
            return Ok(StatusSnapshot::NotModified { fingerprint });
        }
        Ok(StatusSnapshot::Modified {
            view: JobStatusView::from(&job),
            fingerprint,
        })
    }
}

impl core::fmt::Debug for StatusSnapshotService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusSnapshotService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_auth::Role;
    use scribe_core::{JobType, NewJob, Priority, TenantId, Transition, UserId};
    use serde_json::json;

    use crate::jobs::InMemoryJobStore;

    async fn setup() -> (Arc<InMemoryJobStore>, StatusSnapshotService, Identity, Job) {
        let store = InMemoryJobStore::arc();
        let identity = Identity::new(TenantId::new(), UserId::new(), vec![Role::USER]);
        let job = Job::new(
            NewJob {
                tenant_id: identity.tenant_id,
                user_id: identity.user_id,
                workflow_id: None,
                job_type: JobType::default(),
                priority: Priority::default(),
                input_location: "in.wav".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let job = store.create(job).await.unwrap();
        (store.clone(), StatusSnapshotService::new(store), identity, job)
    }

    #[tokio::test]
    async fn unchanged_job_is_not_modified_until_it_transitions() {
        let (store, snapshots, identity, job) = setup().await;

        let first = snapshots.get_status(&identity, job.id, None).await.unwrap();
        assert!(first.is_modified());
        let f1 = first.fingerprint().clone();

        let again = snapshots
            .get_status(&identity, job.id, Some(&f1.to_etag()))
            .await
            .unwrap();
        assert_eq!(again, StatusSnapshot::NotModified { fingerprint: f1.clone() });

        store
            .transition(job.tenant_id, job.id, Transition::Start)
            .await
            .unwrap();
        store
            .transition(
                job.tenant_id,
                job.id,
                Transition::Complete {
                    result_location: "out.json".into(),
                },
            )
            .await
            .unwrap();

        match snapshots.get_status(&identity, job.id, Some(f1.as_str())).await.unwrap() {
            StatusSnapshot::Modified { view, fingerprint } => {
                assert_ne!(fingerprint, f1);
                assert_eq!(view.status, JobStatus::Completed);
                assert_eq!(view.result, Some(json!({"path": "out.json"})));
                assert!(view.completed_at.is_some());
            }
            other => panic!("expected a full body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn foreign_callers_are_refused() {
        let (_store, snapshots, identity, job) = setup().await;

        let stranger = Identity::new(TenantId::new(), UserId::new(), vec![Role::ADMIN]);
        let err = snapshots.get_status(&stranger, job.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "unauthorized");

        let colleague = Identity::new(identity.tenant_id, UserId::new(), vec![Role::USER]);
        let err = snapshots.get_status(&colleague, job.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "unauthorized");

        let err = snapshots
            .get_status(&identity, JobId::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
