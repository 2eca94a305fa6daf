//! Job handlers and type-based routing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use scribe_core::{Job, JobType, ResourceKind};
use scribe_events::{JobUpdate, StatusPublisher};

/// Outcome of a handler run that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    /// The handler observed a cancel request and stopped.
    #[error("canceled")]
    Canceled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// What a successful handler produced.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub result_location: String,
    /// Metered amounts beyond processing time (which the dispatcher measures).
    pub usage: Vec<(ResourceKind, f64)>,
}

impl JobOutput {
    pub fn new(result_location: impl Into<String>) -> Self {
        Self {
            result_location: result_location.into(),
            usage: Vec::new(),
        }
    }

    pub fn with_usage(mut self, kind: ResourceKind, amount: f64) -> Self {
        self.usage.push((kind, amount));
        self
    }
}

/// Everything a handler gets for one run.
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
    publisher: Arc<dyn StatusPublisher>,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            job,
            cancel,
            publisher,
        }
    }

    /// The job as persisted when it entered `processing`.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_canceled() {
            Err(HandlerError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Push a progress report to live subscribers (not persisted).
    pub fn report_progress(&self, percent: u8) {
        self.publisher.publish(JobUpdate::progress(&self.job, percent));
    }
}

impl core::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<JobOutput, HandlerError>;
}

/// Adapter for closure handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JobOutput, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Routes job types to handlers.
///
/// Lookup order: exact type name, then the longest matching category
/// pattern (`"audio.*"` matches `"audio.transcribe"`), then `"*"`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn register_fn<F, Fut>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutput, HandlerError>> + Send + 'static,
    {
        self.register(pattern, Arc::new(FnHandler(handler)));
    }

    pub fn resolve(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        let name = job_type.as_str();
        if let Some(h) = self.handlers.get(name) {
            return Some(Arc::clone(h));
        }

        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(Arc::clone(handler));
        }

        self.handlers.get("*").cloned()
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}
