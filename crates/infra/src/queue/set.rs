use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use scribe_core::{JobId, Priority, TenantId};

use super::tenant_queue::{Next, PushError, QueuedJob, TenantQueue};
use crate::policy::TenantPolicy;

/// Executes one dequeued job. Implemented by the dispatcher.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: QueuedJob);
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a worker loop waits on an empty queue before exiting.
    pub idle_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("tenant {tenant_id} has reached its limit of {limit} queued jobs")]
    CapacityExceeded { tenant_id: TenantId, limit: usize },
    #[error("queues are shutting down")]
    ShuttingDown,
}

type Registry = Arc<Mutex<HashMap<TenantId, Arc<TenantQueue>>>>;

/// Tenant-partitioned priority queues with lazily started worker loops.
///
/// ## Scheduling
///
/// - One queue per tenant, created on first enqueue and evicted once its last
///   worker loop has been idle for `idle_timeout`
/// - Within a tenant: ascending priority, then arrival order
/// - Across tenants: no shared lock or shared worker, so a busy tenant never
///   delays another tenant's jobs
/// - Worker loops per tenant: at most `max_concurrent_jobs`
pub struct TenantQueueSet {
    queues: Registry,
    policy: Arc<dyn TenantPolicy>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl TenantQueueSet {
    pub fn new(config: QueueConfig, policy: Arc<dyn TenantPolicy>, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            policy,
            runner,
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Admit a job into its tenant's queue, starting a worker loop if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, tenant_id: TenantId, job_id: JobId, priority: Priority) -> Result<QueuedJob, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        let limits = self.policy.limits(tenant_id);

        loop {
            let queue = self.queue_for(tenant_id);
            match queue.push(job_id, priority, limits) {
                Ok(pushed) => {
                    debug!(
                        %tenant_id,
                        %job_id,
                        priority = priority.value(),
                        seq = pushed.job.seq,
                        "job enqueued"
                    );
                    if pushed.spawn_worker {
                        self.spawn_worker(queue);
                    }
                    return Ok(pushed.job);
                }
                // Lost a race with idle eviction; start a fresh queue.
                Err(PushError::Closed) => remove_if_current(&self.queues, &queue),
                Err(PushError::Full { limit }) => {
                    return Err(QueueError::CapacityExceeded { tenant_id, limit });
                }
            }
        }
    }

    /// Whether the tenant is below its admission ceiling.
    pub fn has_capacity(&self, tenant_id: TenantId) -> bool {
        let limits = self.policy.limits(tenant_id);
        self.existing(tenant_id).is_none_or(|q| q.has_room(limits))
    }

    /// Jobs waiting (not yet taken by a worker).
    pub fn queue_length(&self, tenant_id: TenantId) -> usize {
        self.existing(tenant_id).map_or(0, |q| q.waiting())
    }

    pub fn in_flight(&self, tenant_id: TenantId) -> usize {
        self.existing(tenant_id).map_or(0, |q| q.in_flight())
    }

    pub fn worker_count(&self, tenant_id: TenantId) -> usize {
        self.existing(tenant_id).map_or(0, |q| q.workers())
    }

    /// Tenants that currently have a queue.
    pub fn active_tenants(&self) -> Vec<TenantId> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting work and wait for worker loops to finish their current job.
    ///
    /// Jobs still waiting stay `queued` in the job store.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("tenant queues stopped");
    }

    fn existing(&self, tenant_id: TenantId) -> Option<Arc<TenantQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .cloned()
    }

    fn queue_for(&self, tenant_id: TenantId) -> Arc<TenantQueue> {
        Arc::clone(
            self.queues
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(tenant_id)
                .or_insert_with(|| Arc::new(TenantQueue::new(tenant_id))),
        )
    }

    fn spawn_worker(&self, queue: Arc<TenantQueue>) {
        let registry = Arc::clone(&self.queues);
        let runner = Arc::clone(&self.runner);
        let idle_timeout = self.config.idle_timeout;
        let shutdown = self.shutdown.clone();
        self.tracker
            .spawn(worker_loop(queue, registry, runner, idle_timeout, shutdown));
    }
}

impl core::fmt::Debug for TenantQueueSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TenantQueueSet")
            .field("config", &self.config)
            .field("tenants", &self.active_tenants().len())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    queue: Arc<TenantQueue>,
    registry: Registry,
    runner: Arc<dyn JobRunner>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let tenant_id = queue.tenant_id();
    debug!(%tenant_id, "tenant worker started");

    loop {
        match queue.next(idle_timeout, &shutdown).await {
            Next::Job(job) => {
                let job_id = job.job_id;
                if AssertUnwindSafe(runner.run(job)).catch_unwind().await.is_err() {
                    error!(%tenant_id, %job_id, "job runner panicked");
                }
                queue.finish();
            }
            Next::Idle => {
                debug!(%tenant_id, "tenant worker idle, stopping");
                break;
            }
            Next::Evicted => {
                remove_if_current(&registry, &queue);
                info!(%tenant_id, "tenant queue idle, evicted");
                break;
            }
            Next::Shutdown => {
                debug!(%tenant_id, "tenant worker stopping for shutdown");
                break;
            }
        }
    }
}

fn remove_if_current(registry: &Registry, queue: &Arc<TenantQueue>) {
    let mut queues = registry.lock().unwrap_or_else(PoisonError::into_inner);
    if queues
        .get(&queue.tenant_id())
        .is_some_and(|current| Arc::ptr_eq(current, queue))
    {
        queues.remove(&queue.tenant_id());
    }
}
