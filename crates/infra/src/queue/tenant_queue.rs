//! A single tenant's priority queue and worker bookkeeping.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use scribe_core::{JobId, Priority, TenantId};

use crate::policy::TenantLimits;

/// A job reference waiting in (or taken from) a tenant queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub priority: Priority,
    /// Arrival order within the tenant queue; breaks priority ties.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Heap entry: the max element is the lowest `(priority, seq)`.
#[derive(Debug, PartialEq, Eq)]
struct Pending(QueuedJob);

impl Pending {
    fn key(&self) -> (Priority, u64) {
        (self.0.priority, self.0.seq)
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
    /// Taken by a worker and not yet finished.
    in_flight: usize,
    /// Live worker loops.
    workers: usize,
    /// Worker loops currently waiting for work.
    idle: usize,
    /// Set by the last worker on idle exit; a closed queue accepts nothing.
    closed: bool,
}

#[derive(Debug)]
pub(crate) enum PushError {
    Closed,
    Full { limit: usize },
}

#[derive(Debug)]
pub(crate) struct Pushed {
    pub job: QueuedJob,
    /// The caller must start one more worker loop for this queue.
    pub spawn_worker: bool,
}

#[derive(Debug)]
pub(crate) enum Next {
    Job(QueuedJob),
    /// Idle timeout elapsed; other workers remain.
    Idle,
    /// Idle timeout elapsed for the last worker; the queue is now closed.
    Evicted,
    Shutdown,
}

enum Wake {
    Notified,
    TimedOut,
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct TenantQueue {
    tenant_id: TenantId,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TenantQueue {
    pub(crate) fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(
        &self,
        job_id: JobId,
        priority: Priority,
        limits: TenantLimits,
    ) -> Result<Pushed, PushError> {
        let mut st = self.lock();
        if st.closed {
            return Err(PushError::Closed);
        }
        if st.heap.len() + st.in_flight >= limits.max_queued_jobs {
            return Err(PushError::Full {
                limit: limits.max_queued_jobs,
            });
        }

        let job = QueuedJob {
            tenant_id: self.tenant_id,
            job_id,
            priority,
            seq: st.next_seq,
            enqueued_at: Utc::now(),
        };
        st.next_seq += 1;
        st.heap.push(Pending(job.clone()));

        // More waiting jobs than waiting workers: grow up to the limit.
        let spawn_worker = st.heap.len() > st.idle && st.workers < limits.max_concurrent_jobs;
        if spawn_worker {
            st.workers += 1;
        }
        drop(st);

        self.notify.notify_one();
        Ok(Pushed { job, spawn_worker })
    }

    /// Wait for the next job, the idle timeout, or shutdown.
    pub(crate) async fn next(&self, idle_timeout: Duration, shutdown: &CancellationToken) -> Next {
        loop {
            {
                let mut st = self.lock();
                if shutdown.is_cancelled() {
                    st.workers -= 1;
                    return Next::Shutdown;
                }
                if let Some(Pending(job)) = st.heap.pop() {
                    st.in_flight += 1;
                    return Next::Job(job);
                }
                st.idle += 1;
            }

            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = self.notify.notified() => Wake::Notified,
                _ = tokio::time::sleep(idle_timeout) => Wake::TimedOut,
            };

            let outcome = {
                let mut st = self.lock();
                st.idle -= 1;
                match wake {
                    Wake::Notified => None,
                    Wake::TimedOut if !st.heap.is_empty() => None,
                    Wake::Shutdown => {
                        st.workers -= 1;
                        Some(Next::Shutdown)
                    }
                    Wake::TimedOut => {
                        st.workers -= 1;
                        if st.workers == 0 {
                            st.closed = true;
                            Some(Next::Evicted)
                        } else {
                            Some(Next::Idle)
                        }
                    }
                }
            };
            if let Some(next) = outcome {
                return next;
            }
        }
    }

    /// Mark a job returned by [`TenantQueue::next`] as done.
    pub(crate) fn finish(&self) {
        let mut st = self.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
    }

    /// Whether one more job would be admitted under `limits`.
    ///
    /// A closed queue is empty and about to be replaced by a fresh one, so it
    /// is judged as empty.
    pub(crate) fn has_room(&self, limits: TenantLimits) -> bool {
        let st = self.lock();
        let occupied = if st.closed { 0 } else { st.heap.len() + st.in_flight };
        occupied < limits.max_queued_jobs
    }

    pub(crate) fn waiting(&self) -> usize {
        self.lock().heap.len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub(crate) fn workers(&self) -> usize {
        self.lock().workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_concurrent_jobs: usize, max_queued_jobs: usize) -> TenantLimits {
        TenantLimits {
            max_concurrent_jobs,
            max_queued_jobs,
        }
    }

    fn priority(p: i64) -> Priority {
        Priority::new(p).unwrap()
    }

    #[tokio::test]
    async fn pops_by_priority_then_arrival() {
        let queue = TenantQueue::new(TenantId::new());
        let ids: Vec<JobId> = (0..4).map(|_| JobId::new()).collect();
        for (id, p) in ids.iter().zip([2, 1, 2, 1]) {
            queue.push(*id, priority(p), limits(1, 10)).unwrap();
        }

        let shutdown = CancellationToken::new();
        let mut order = Vec::new();
        for _ in 0..4 {
            match queue.next(Duration::from_millis(10), &shutdown).await {
                Next::Job(job) => order.push(job.job_id),
                other => panic!("expected a job, got {other:?}"),
            }
        }
        assert_eq!(order, vec![ids[1], ids[3], ids[0], ids[2]]);
    }

    #[test]
    fn ceiling_counts_waiting_and_in_flight() {
        let queue = TenantQueue::new(TenantId::new());
        let l = limits(1, 2);
        assert!(queue.push(JobId::new(), Priority::default(), l).unwrap().spawn_worker);
        assert!(!queue.push(JobId::new(), Priority::default(), l).unwrap().spawn_worker);
        assert!(!queue.has_room(l));
        assert!(matches!(
            queue.push(JobId::new(), Priority::default(), l),
            Err(PushError::Full { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn last_idle_worker_closes_the_queue() {
        let queue = TenantQueue::new(TenantId::new());
        let pushed = queue.push(JobId::new(), Priority::default(), limits(1, 5)).unwrap();
        assert!(pushed.spawn_worker);

        let shutdown = CancellationToken::new();
        assert!(matches!(
            queue.next(Duration::from_millis(5), &shutdown).await,
            Next::Job(_)
        ));
        queue.finish();
        assert!(matches!(
            queue.next(Duration::from_millis(5), &shutdown).await,
            Next::Evicted
        ));
        assert!(matches!(
            queue.push(JobId::new(), Priority::default(), limits(1, 5)),
            Err(PushError::Closed)
        ));
    }

    proptest::proptest! {
        #[test]
        fn heap_orders_by_priority_then_seq(priorities in proptest::collection::vec(1i64..=10, 1..40)) {
            let tenant_id = TenantId::new();
            let mut heap = BinaryHeap::new();
            for (seq, p) in priorities.iter().enumerate() {
                heap.push(Pending(QueuedJob {
                    tenant_id,
                    job_id: JobId::new(),
                    priority: priority(*p),
                    seq: seq as u64,
                    enqueued_at: Utc::now(),
                }));
            }

            let mut keys = Vec::new();
            while let Some(pending) = heap.pop() {
                keys.push(pending.key());
            }
            let mut sorted = keys.clone();
            sorted.sort();
            proptest::prop_assert_eq!(keys, sorted);
        }
    }

    #[tokio::test]
    async fn evicted_queue_still_reports_room() {
        let queue = TenantQueue::new(TenantId::new());
        let l = limits(1, 100);
        queue.push(JobId::new(), Priority::default(), l).unwrap();

        let shutdown = CancellationToken::new();
        assert!(matches!(
            queue.next(Duration::from_millis(5), &shutdown).await,
            Next::Job(_)
        ));
        queue.finish();
        assert!(matches!(
            queue.next(Duration::from_millis(5), &shutdown).await,
            Next::Evicted
        ));

        assert!(queue.has_room(l));
        assert!(queue.has_room(limits(1, 1)));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_worker() {
        let queue = TenantQueue::new(TenantId::new());
        queue.push(JobId::new(), Priority::default(), limits(1, 5)).unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(matches!(
            queue.next(Duration::from_secs(60), &shutdown).await,
            Next::Shutdown
        ));
        assert_eq!(queue.workers(), 0);
    }
}
