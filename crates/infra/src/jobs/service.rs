//! Job admission and management on behalf of an authenticated caller.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use scribe_auth::{Identity, authorize_job_access};
use scribe_core::{Job, JobId, JobStatus, JobType, NewJob, Priority, Transition, WorkflowId};

use super::dispatcher::JobDispatcher;
use super::error::JobError;
use super::store::{JobFilter, JobStore};
use crate::ledger::{ResourceLedger, UsageSummary};
use crate::queue::TenantQueueSet;

/// Error detail for jobs interrupted by a restart while processing.
pub const INTERRUPTED_DETAIL: &str = "interrupted by service restart";

/// A job submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitJob {
    pub workflow_id: Option<WorkflowId>,
    pub input_location: String,
    /// 1 (most urgent) ..= 10; defaults to 1.
    pub priority: Option<i64>,
    /// Defaults to `transcription`.
    pub job_type: Option<String>,
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn ResourceLedger>,
    queues: Arc<TenantQueueSet>,
    dispatcher: Arc<JobDispatcher>,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn ResourceLedger>,
        queues: Arc<TenantQueueSet>,
        dispatcher: Arc<JobDispatcher>,
    ) -> Self {
        Self {
            store,
            ledger,
            queues,
            dispatcher,
        }
    }

    /// Admit a job: quota and capacity checks, persist as `queued`, enqueue.
    ///
    /// On `CapacityExceeded` no job is left waiting: if the queue fills between
    /// the check and the enqueue, the just-created record is canceled.
    pub async fn submit(&self, identity: &Identity, request: SubmitJob) -> Result<Job, JobError> {
        let tenant_id = identity.tenant_id;
        let priority = match request.priority {
            Some(p) => Priority::new(p)?,
            None => Priority::default(),
        };
        let job_type = match request.job_type {
            Some(name) => JobType::new(name)?,
            None => JobType::default(),
        };
        let job = Job::new(
            NewJob {
                tenant_id,
                user_id: identity.user_id,
                workflow_id: request.workflow_id,
                job_type,
                priority,
                input_location: request.input_location,
            },
            Utc::now(),
        )?;

        self.admit(job).await
    }

    pub async fn get(&self, identity: &Identity, job_id: JobId) -> Result<Job, JobError> {
        let job = self
            .store
            .get(identity.tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        authorize_job_access(identity, &job)?;
        Ok(job)
    }

    /// List the caller's jobs; admins see every job in the tenant.
    pub async fn list(&self, identity: &Identity, mut filter: JobFilter) -> Result<Vec<Job>, JobError> {
        if !identity.is_admin() {
            filter.user_id = Some(identity.user_id);
        }
        Ok(self.store.list(identity.tenant_id, &filter).await?)
    }

    /// Cancel a job. Canceling a terminal job is a no-op.
    pub async fn cancel(&self, identity: &Identity, job_id: JobId) -> Result<Job, JobError> {
        self.get(identity, job_id).await?;
        self.dispatcher.cancel(identity.tenant_id, job_id).await
    }

    /// Submit a new attempt of a failed or canceled job.
    pub async fn retry(&self, identity: &Identity, job_id: JobId) -> Result<Job, JobError> {
        let previous = self.get(identity, job_id).await?;
        let next = previous.successor(Utc::now())?;
        info!(tenant_id = %previous.tenant_id, %job_id, retry_id = %next.id, "retrying job");
        self.admit(next).await
    }

    pub async fn usage(&self, identity: &Identity) -> Result<UsageSummary, JobError> {
        Ok(self.ledger.summary(identity.tenant_id, Utc::now()).await?)
    }

    /// Re-enqueue jobs left `queued` by a previous run and fail the ones it
    /// left `processing`.
    pub async fn recover(&self) -> Result<RecoveryReport, JobError> {
        let mut report = RecoveryReport::default();
        for job in self.store.list_unfinished().await? {
            match job.status {
                JobStatus::Queued => match self.queues.enqueue(job.tenant_id, job.id, job.priority) {
                    Ok(_) => report.requeued += 1,
                    Err(err) => {
                        warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "could not requeue job");
                        self.store
                            .transition(job.tenant_id, job.id, Transition::Cancel)
                            .await?;
                    }
                },
                JobStatus::Processing => {
                    self.store
                        .transition(
                            job.tenant_id,
                            job.id,
                            Transition::Fail {
                                error: INTERRUPTED_DETAIL.to_string(),
                            },
                        )
                        .await?;
                    report.failed += 1;
                }
                _ => {}
            }
        }
        if report != RecoveryReport::default() {
            info!(requeued = report.requeued, failed = report.failed, "recovered unfinished jobs");
        }
        Ok(report)
    }

    async fn admit(&self, job: Job) -> Result<Job, JobError> {
        let tenant_id = job.tenant_id;
        self.ledger.check_quota(tenant_id, Utc::now()).await?;
        if !self.queues.has_capacity(tenant_id) {
            return Err(JobError::CapacityExceeded(format!(
                "tenant {tenant_id} has too many pending jobs"
            )));
        }

        let job = self.store.create(job).await?;
        if let Err(err) = self.queues.enqueue(tenant_id, job.id, job.priority) {
            warn!(%tenant_id, job_id = %job.id, error = %err, "enqueue rejected after create");
            if let Err(cleanup) = self
                .store
                .transition(tenant_id, job.id, Transition::Cancel)
                .await
            {
                warn!(%tenant_id, job_id = %job.id, error = %cleanup, "failed to cancel unadmitted job");
            }
            return Err(err.into());
        }

        info!(%tenant_id, job_id = %job.id, priority = job.priority.value(), "job submitted");
        Ok(job)
    }
}

impl core::fmt::Debug for JobService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobService")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
