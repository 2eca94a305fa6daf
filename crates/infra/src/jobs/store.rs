//! Job storage.
//!
//! The store is the source of truth for job state. Every status change goes
//! through [`JobStore::transition`], an atomic compare-and-set against the
//! state machine in [`scribe_core::Job::apply`]: two racing writers can never
//! both move the same job out of the same state.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use scribe_core::{DomainError, Job, JobId, JobStatus, TenantId, Transition, UserId};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly created job.
    async fn create(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    ///
    /// Returns `TenantIsolation` if the job exists under another tenant.
    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically apply a status transition and return the updated job.
    async fn transition(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        transition: Transition,
    ) -> Result<Job, JobStoreError>;

    /// List a tenant's jobs, newest first.
    async fn list(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Every non-terminal job across all tenants, oldest first.
    ///
    /// Used at startup to recover work interrupted by a restart.
    async fn list_unfinished(&self) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id}: {source}")]
    Transition {
        job_id: JobId,
        current: JobStatus,
        #[source]
        source: DomainError,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Restrict to jobs submitted by one user.
    pub user_id: Option<UserId>,
    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;
    /// Largest offset a SQL `OFFSET` (bigint) can take.
    pub const MAX_OFFSET: usize = i64::MAX as usize;

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit.clamp(1, Self::MAX_LIMIT);
        self.offset = offset.min(Self::MAX_OFFSET);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s) && self.user_id.is_none_or(|u| job.user_id == u)
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            user_id: None,
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(&job_id) {
            Some(job) if job.tenant_id == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        transition: Transition,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.tenant_id != tenant_id {
            return Err(JobStoreError::TenantIsolation);
        }

        // Apply to a copy so a rejected transition leaves the record untouched.
        let mut next = job.clone();
        next.apply(transition, Utc::now())
            .map_err(|source| JobStoreError::Transition {
                job_id,
                current: job.status,
                source,
            })?;
        *job = next.clone();
        Ok(next)
    }

    async fn list(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.as_uuid().cmp(&a.id.as_uuid())));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut unfinished: Vec<Job> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|j| (j.created_at, *j.id.as_uuid()));
        Ok(unfinished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{JobType, NewJob, Priority};

    fn new_job(tenant_id: TenantId, user_id: UserId) -> Job {
        Job::new(
            NewJob {
                tenant_id,
                user_id,
                workflow_id: None,
                job_type: JobType::default(),
                priority: Priority::default(),
                input_location: "audio.wav".into(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn get_enforces_tenant_isolation() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let job = store.create(new_job(tenant, UserId::new())).await.unwrap();

        assert!(store.get(tenant, job.id).await.unwrap().is_some());
        assert!(matches!(
            store.get(TenantId::new(), job.id).await,
            Err(JobStoreError::TenantIsolation)
        ));
        assert!(store.get(tenant, JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = new_job(TenantId::new(), UserId::new());
        store.create(job.clone()).await.unwrap();
        assert!(matches!(
            store.create(job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let job = store.create(new_job(tenant, UserId::new())).await.unwrap();

        let started = store.transition(tenant, job.id, Transition::Start).await.unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert!(started.updated_at > job.updated_at);

        // A second start loses the race and leaves the record unchanged.
        let err = store
            .transition(tenant, job.id, Transition::Start)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::Transition {
                current: JobStatus::Processing,
                ..
            }
        ));
        let current = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(current, started);
    }

    #[tokio::test]
    async fn terminal_jobs_never_leave_terminal_state() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let job = store.create(new_job(tenant, UserId::new())).await.unwrap();
        store.transition(tenant, job.id, Transition::Cancel).await.unwrap();

        for t in [
            Transition::Start,
            Transition::Cancel,
            Transition::Fail { error: "x".into() },
        ] {
            assert!(store.transition(tenant, job.id, t).await.is_err());
        }
        let current = store.get(tenant, job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn list_filters_and_pages_newest_first() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let mut ids = Vec::new();
        for user in [alice, bob, alice] {
            let job = store.create(new_job(tenant, user)).await.unwrap();
            ids.push(job.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store.create(new_job(TenantId::new(), alice)).await.unwrap();

        let all = store.list(tenant, &JobFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);

        let alice_only = store
            .list(tenant, &JobFilter::default().for_user(alice))
            .await
            .unwrap();
        assert_eq!(alice_only.len(), 2);

        let second_page = store
            .list(tenant, &JobFilter::default().page(1, 1))
            .await
            .unwrap();
        assert_eq!(second_page[0].id, ids[1]);

        store.transition(tenant, ids[0], Transition::Cancel).await.unwrap();
        let canceled = store
            .list(tenant, &JobFilter::default().with_status(JobStatus::Canceled))
            .await
            .unwrap();
        assert_eq!(canceled.len(), 1);

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 3);
    }

    #[tokio::test]
    async fn unfinished_jobs_come_back_oldest_first() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = store.create(new_job(tenant, UserId::new())).await.unwrap();
            ids.push(job.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let done = store.create(new_job(tenant, UserId::new())).await.unwrap();
        store.transition(tenant, done.id, Transition::Cancel).await.unwrap();
        store.transition(tenant, ids[1], Transition::Start).await.unwrap();

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.iter().map(|j| j.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn page_bounds_limit_and_offset() {
        let filter = JobFilter::default().page(0, usize::MAX);
        assert_eq!(filter.limit, 1);
        assert_eq!(filter.offset, JobFilter::MAX_OFFSET);
        assert!(i64::try_from(filter.offset).is_ok());

        let filter = JobFilter::default().page(10_000, 20);
        assert_eq!(filter.limit, JobFilter::MAX_LIMIT);
        assert_eq!(filter.offset, 20);
    }
}
