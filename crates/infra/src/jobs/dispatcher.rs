//! Job dispatcher: drives one job through its lifecycle.
//!
//! For every dequeued job:
//!
//! 1. Load it; skip unless still `queued` (it may have been canceled while waiting)
//! 2. Persist `processing`, then publish it
//! 3. Run the routed handler with a cancellation token; a panic is contained
//! 4. Persist the terminal state, then publish it
//! 5. On success, record usage in the resource ledger (exactly once, one retry)
//!
//! Every status change is persisted before it is published, so subscribers
//! never observe a state the store does not hold.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scribe_core::{DomainError, Job, JobId, JobStatus, ResourceKind, TenantId, Transition, UsageRecord};
use scribe_events::{JobUpdate, StatusPublisher};

use super::error::JobError;
use super::handler::{HandlerError, HandlerRegistry, JobContext, JobOutput};
use super::store::{JobStore, JobStoreError};
use crate::ledger::{LedgerError, ResourceLedger};
use crate::queue::{JobRunner, QueuedJob};

/// Error detail stored when a handler panics.
pub const INTERNAL_ERROR_DETAIL: &str = "internal error while processing job";

pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn ResourceLedger>,
    publisher: Arc<dyn StatusPublisher>,
    handlers: HandlerRegistry,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

/// Terminal outcome of a handler run, before it is persisted.
enum Outcome {
    Completed(JobOutput),
    Failed(String),
    Canceled,
}

impl JobDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn ResourceLedger>,
        publisher: Arc<dyn StatusPublisher>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            store,
            ledger,
            publisher,
            handlers,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Process one dequeued job to a terminal state.
    ///
    /// Returns the job as last persisted. A job that is no longer `queued` is
    /// returned untouched.
    pub async fn process_job(&self, queued: &QueuedJob) -> Result<Job, JobError> {
        let tenant_id = queued.tenant_id;
        let job_id = queued.job_id;

        let job = self
            .store
            .get(tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if job.status != JobStatus::Queued {
            debug!(%tenant_id, %job_id, status = %job.status, "skipping job that is no longer queued");
            return Ok(job);
        }

        // Register the token before starting so a cancel racing the start is seen.
        let token = CancellationToken::new();
        self.lock_running().insert(job_id, token.clone());

        let job = match self.store.transition(tenant_id, job_id, Transition::Start).await {
            Ok(job) => job,
            Err(JobStoreError::Transition { .. }) => {
                self.lock_running().remove(&job_id);
                debug!(%tenant_id, %job_id, "job left queued state before start");
                return self.current(tenant_id, job_id).await;
            }
            Err(err) => {
                self.lock_running().remove(&job_id);
                return Err(err.into());
            }
        };
        self.publisher.publish(JobUpdate::from_job(&job));
        info!(%tenant_id, %job_id, job_type = %job.job_type, "job started");

        let started = Instant::now();
        let outcome = if token.is_cancelled() {
            Outcome::Canceled
        } else {
            self.run_handler(&job, token).await
        };
        let elapsed = started.elapsed();
        self.lock_running().remove(&job_id);

        let (transition, output) = match outcome {
            Outcome::Completed(output) => {
                let transition = Transition::Complete {
                    result_location: output.result_location.clone(),
                };
                (transition, Some(output))
            }
            Outcome::Failed(error) => (Transition::Fail { error }, None),
            Outcome::Canceled => (Transition::Cancel, None),
        };

        let finished = match self.store.transition(tenant_id, job_id, transition).await {
            Ok(job) => job,
            Err(JobStoreError::Transition {
                current,
                source: DomainError::InvalidTransition { .. },
                ..
            }) => {
                warn!(%tenant_id, %job_id, %current, "job reached a terminal state elsewhere");
                return self.current(tenant_id, job_id).await;
            }
            // The outcome itself was rejected; the job must still terminate.
            Err(JobStoreError::Transition { source, .. }) => {
                error!(%tenant_id, %job_id, error = %source, "job outcome rejected; failing job");
                let fail = Transition::Fail {
                    error: INTERNAL_ERROR_DETAIL.to_string(),
                };
                match self.store.transition(tenant_id, job_id, fail).await {
                    Ok(job) => job,
                    Err(JobStoreError::Transition { .. }) => return self.current(tenant_id, job_id).await,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => {
                error!(%tenant_id, %job_id, error = %err, "failed to persist job outcome");
                return Err(err.into());
            }
        };
        self.publisher.publish(JobUpdate::from_job(&finished));

        match finished.status {
            JobStatus::Completed => {
                info!(%tenant_id, %job_id, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                let extra = output.map(|o| o.usage).unwrap_or_default();
                if let Err(err) = self.record_usage(&finished, elapsed.as_secs_f64(), extra).await {
                    error!(%tenant_id, %job_id, error = %err, "completed job left unbilled");
                    return Err(err.into());
                }
            }
            JobStatus::Canceled => info!(%tenant_id, %job_id, "job canceled"),
            _ => warn!(%tenant_id, %job_id, error = finished.error.as_deref().unwrap_or(""), "job failed"),
        }
        Ok(finished)
    }

    /// Request cancellation.
    ///
    /// - terminal: no-op, returns the job unchanged
    /// - queued: persisted as `canceled` immediately
    /// - processing: the handler's token is triggered; the job becomes
    ///   `canceled` once the handler stops
    pub async fn cancel(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobError> {
        let job = self.current(tenant_id, job_id).await?;
        match job.status {
            status if status.is_terminal() => Ok(job),
            JobStatus::Queued => match self.store.transition(tenant_id, job_id, Transition::Cancel).await {
                Ok(canceled) => {
                    self.publisher.publish(JobUpdate::from_job(&canceled));
                    info!(%tenant_id, %job_id, "queued job canceled");
                    Ok(canceled)
                }
                // Started (or finished) in the meantime.
                Err(JobStoreError::Transition { .. }) => {
                    self.signal(job_id);
                    self.current(tenant_id, job_id).await
                }
                Err(err) => Err(err.into()),
            },
            _ => {
                if !self.signal(job_id) {
                    debug!(%tenant_id, %job_id, "no running handler for processing job");
                }
                Ok(job)
            }
        }
    }

    /// Whether a handler is currently running for the job.
    pub fn is_running(&self, job_id: JobId) -> bool {
        self.lock_running().contains_key(&job_id)
    }

    async fn run_handler(&self, job: &Job, token: CancellationToken) -> Outcome {
        let Some(handler) = self.handlers.resolve(&job.job_type) else {
            return Outcome::Failed(format!("no handler registered for job type: {}", job.job_type));
        };

        let ctx = JobContext::new(job.clone(), token, Arc::clone(&self.publisher));
        match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
            Ok(Ok(output)) if output.result_location.trim().is_empty() => {
                error!(job_id = %job.id, "job handler returned an empty result location");
                Outcome::Failed(INTERNAL_ERROR_DETAIL.to_string())
            }
            Ok(Ok(output)) => Outcome::Completed(output),
            Ok(Err(HandlerError::Canceled)) => Outcome::Canceled,
            Ok(Err(HandlerError::Failed(error))) => Outcome::Failed(error),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(job_id = %job.id, panic = %detail, "job handler panicked");
                Outcome::Failed(INTERNAL_ERROR_DETAIL.to_string())
            }
        }
    }

    /// Record processing time plus handler-reported usage.
    ///
    /// Recording is idempotent per job and resource kind, so a failed write is
    /// retried once before giving up.
    async fn record_usage(
        &self,
        job: &Job,
        processing_seconds: f64,
        extra: Vec<(ResourceKind, f64)>,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut records = vec![UsageRecord::for_job(job, ResourceKind::Processing, processing_seconds, now)];
        records.extend(
            extra
                .into_iter()
                .filter(|(kind, _)| *kind != ResourceKind::Processing)
                .map(|(kind, amount)| UsageRecord::for_job(job, kind, amount.max(0.0), now)),
        );

        let written = match self.ledger.record_usage(&records).await {
            Ok(written) => written,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to record usage; retrying");
                self.ledger.record_usage(&records).await?
            }
        };
        debug!(job_id = %job.id, written, "usage recorded");
        Ok(())
    }

    async fn current(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobError> {
        self.store
            .get(tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    fn signal(&self, job_id: JobId) -> bool {
        match self.lock_running().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobRunner for JobDispatcher {
    async fn run(&self, job: QueuedJob) {
        if let Err(err) = self.process_job(&job).await {
            error!(tenant_id = %job.tenant_id, job_id = %job.job_id, error = %err, "job dispatch failed");
        }
    }
}
