//! Assembly of the job-processing core.
//!
//! Owns every long-lived component so startup and teardown happen in one
//! place: the fanout is the dispatcher's publisher, the dispatcher is the
//! queue set's runner, and shutdown stops intake before closing connections.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fanout::{FanoutConfig, StatusFanout};
use crate::jobs::{HandlerRegistry, JobDispatcher, JobError, JobService, JobStore, RecoveryReport};
use crate::ledger::ResourceLedger;
use crate::policy::TenantPolicy;
use crate::queue::{QueueConfig, TenantQueueSet};
use crate::snapshot::StatusSnapshotService;

#[derive(Debug, Clone, Default)]
pub struct JobSystemConfig {
    pub queue: QueueConfig,
    pub fanout: FanoutConfig,
}

pub struct JobSystem {
    pub store: Arc<dyn JobStore>,
    pub ledger: Arc<dyn ResourceLedger>,
    pub policy: Arc<dyn TenantPolicy>,
    pub dispatcher: Arc<JobDispatcher>,
    pub queues: Arc<TenantQueueSet>,
    pub service: Arc<JobService>,
    pub fanout: Arc<StatusFanout>,
    pub snapshots: StatusSnapshotService,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl JobSystem {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn ResourceLedger>,
        policy: Arc<dyn TenantPolicy>,
        handlers: HandlerRegistry,
        config: JobSystemConfig,
    ) -> Self {
        let fanout = Arc::new(StatusFanout::new(store.clone(), config.fanout));
        let dispatcher = Arc::new(JobDispatcher::new(
            store.clone(),
            ledger.clone(),
            fanout.clone(),
            handlers,
        ));
        let queues = Arc::new(TenantQueueSet::new(config.queue, policy.clone(), dispatcher.clone()));
        let service = Arc::new(JobService::new(
            store.clone(),
            ledger.clone(),
            queues.clone(),
            dispatcher.clone(),
        ));
        let snapshots = StatusSnapshotService::new(store.clone());

        Self {
            store,
            ledger,
            policy,
            dispatcher,
            queues,
            service,
            fanout,
            snapshots,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Recover jobs left unfinished by a previous run and start the
    /// connection reaper. Must be called from within a Tokio runtime.
    pub async fn start(&self) -> Result<RecoveryReport, JobError> {
        let report = self.service.recover().await?;
        let handle = self.fanout.spawn_reaper(self.shutdown.clone());
        if let Some(previous) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }
        info!(requeued = report.requeued, failed = report.failed, "job system started");
        Ok(report)
    }

    /// Stop worker loops (waiting for in-flight jobs), then drop every live
    /// connection.
    pub async fn shutdown(&self) {
        info!("job system shutting down");
        self.queues.shutdown().await;
        self.shutdown.cancel();
        let reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        self.fanout.close_all();
        info!("job system stopped");
    }
}

impl core::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobSystem")
            .field("queues", &self.queues)
            .field("fanout", &self.fanout)
            .finish_non_exhaustive()
    }
}
