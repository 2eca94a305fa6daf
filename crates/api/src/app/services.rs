//! Job core wiring: storage backend, tenant policy and handlers.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use scribe_core::JobType;
use scribe_infra::jobs::{
    CommandTranscriber, HandlerRegistry, InMemoryJobStore, JobStore, PostgresJobStore, TranscriptionHandler,
};
use scribe_infra::ledger::{InMemoryResourceLedger, PostgresResourceLedger, ResourceLedger};
use scribe_infra::{JobSystem, JobSystemConfig, StaticTenantPolicy, TenantPolicy};

use crate::config::ServerConfig;

/// Shared state for request handlers.
pub struct AppServices {
    pub system: JobSystem,
}

impl AppServices {
    pub fn new(system: JobSystem) -> Self {
        Self { system }
    }
}

impl core::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppServices")
            .field("system", &self.system)
            .finish()
    }
}

/// Handlers from configuration: the external-command transcriber when
/// `TRANSCRIBE_COMMAND` is set.
pub fn default_handlers(config: &ServerConfig) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    match config
        .transcribe_command
        .as_deref()
        .and_then(CommandTranscriber::from_command_line)
    {
        Some(transcriber) => {
            handlers.register(
                JobType::TRANSCRIPTION,
                Arc::new(TranscriptionHandler::new(Arc::new(transcriber), config.storage_path.clone())),
            );
        }
        None => warn!("TRANSCRIBE_COMMAND not set; transcription jobs will fail"),
    }
    handlers
}

/// Build the job core for `config`: Postgres when `DATABASE_URL` is set,
/// otherwise in-memory.
pub async fn build_services(config: &ServerConfig, handlers: HandlerRegistry) -> anyhow::Result<AppServices> {
    let policy: Arc<dyn TenantPolicy> = Arc::new(StaticTenantPolicy::new(config.default_limits, config.default_quota));

    let (store, ledger): (Arc<dyn JobStore>, Arc<dyn ResourceLedger>) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PostgresJobStore::new(pool.clone());
            store.ensure_schema().await.context("failed to apply schema")?;
            info!("using postgres job store");
            (
                Arc::new(store),
                Arc::new(PostgresResourceLedger::new(pool, policy.clone())),
            )
        }
        None => {
            info!("using in-memory job store");
            (
                InMemoryJobStore::arc(),
                Arc::new(InMemoryResourceLedger::new(policy.clone())),
            )
        }
    };

    let system = JobSystem::new(
        store,
        ledger,
        policy,
        handlers,
        JobSystemConfig {
            queue: config.queue.clone(),
            fanout: config.fanout.clone(),
        },
    );
    let report = system.start().await.context("failed to recover unfinished jobs")?;
    info!(requeued = report.requeued, failed = report.failed, "job core ready");
    Ok(AppServices::new(system))
}
