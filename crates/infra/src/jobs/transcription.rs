//! Transcription job handler.
//!
//! Runs a [`Transcriber`] on the job's input and writes the result as JSON to
//! `{storage_root}/{tenant_id}/outputs/transcription_{timestamp}_{job_id}.json`.
//! The written size is reported as storage usage.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tokio::process::Command;
use tracing::{debug, info};

use scribe_core::{JobId, ResourceKind, TenantId};

use super::handler::{HandlerError, JobContext, JobHandler, JobOutput};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub input_location: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriberError {
    #[error("failed to launch transcriber: {0}")]
    Launch(#[from] std::io::Error),
    #[error("transcriber exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

/// Speech-to-text engine seam.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<JsonValue, TranscriberError>;
}

/// Runs an external program as `<program> <args...> <input_location>`.
///
/// Stdout is taken as the transcript: parsed as JSON when possible, otherwise
/// wrapped as `{"text": ...}`. The child is killed if the run is canceled.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line (no shell quoting).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, request: &TranscriptionRequest) -> Result<JsonValue, TranscriberError> {
        debug!(program = %self.program, job_id = %request.job_id, "launching transcriber");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.input_location)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(TranscriberError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| json!({ "text": stdout.trim() })))
    }
}

pub struct TranscriptionHandler {
    transcriber: Arc<dyn Transcriber>,
    storage_root: PathBuf,
}

impl TranscriptionHandler {
    pub fn new(transcriber: Arc<dyn Transcriber>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            transcriber,
            storage_root: storage_root.into(),
        }
    }

    fn output_path(&self, tenant_id: TenantId, job_id: JobId) -> PathBuf {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        output_dir(&self.storage_root, tenant_id).join(format!("transcription_{timestamp}_{job_id}.json"))
    }
}

impl core::fmt::Debug for TranscriptionHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TranscriptionHandler")
            .field("storage_root", &self.storage_root)
            .finish_non_exhaustive()
    }
}

fn output_dir(root: &Path, tenant_id: TenantId) -> PathBuf {
    root.join(tenant_id.to_string()).join("outputs")
}

fn io_failure(what: &str, err: std::io::Error) -> HandlerError {
    HandlerError::failed(format!("{what}: {err}"))
}

#[async_trait]
impl JobHandler for TranscriptionHandler {
    async fn handle(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        let job = ctx.job();
        let request = TranscriptionRequest {
            tenant_id: job.tenant_id,
            job_id: job.id,
            input_location: job.input_location.clone(),
        };
        info!(job_id = %request.job_id, tenant_id = %request.tenant_id, "transcribing");
        ctx.report_progress(0);

        let transcript = tokio::select! {
            result = self.transcriber.transcribe(&request) => {
                result.map_err(|e| HandlerError::failed(e.to_string()))?
            }
            _ = ctx.cancelled() => return Err(HandlerError::Canceled),
        };
        ctx.checkpoint()?;

        let path = self.output_path(request.tenant_id, request.job_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_failure("create output directory", e))?;
        }
        let body = serde_json::to_vec_pretty(&transcript)
            .map_err(|e| HandlerError::failed(format!("encode transcript: {e}")))?;
        tokio::fs::write(&path, &body)
            .await
            .map_err(|e| io_failure("write transcript", e))?;

        ctx.report_progress(100);
        Ok(JobOutput::new(path.to_string_lossy()).with_usage(ResourceKind::Storage, body.len() as f64 / BYTES_PER_MB))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{Job, JobType, NewJob, Priority, UserId};
    use scribe_events::InMemoryStatusBus;
    use tokio_util::sync::CancellationToken;

    struct FixedTranscriber(JsonValue);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _request: &TranscriptionRequest) -> Result<JsonValue, TranscriberError> {
            Ok(self.0.clone())
        }
    }

    struct StuckTranscriber;

    #[async_trait]
    impl Transcriber for StuckTranscriber {
        async fn transcribe(&self, _request: &TranscriptionRequest) -> Result<JsonValue, TranscriberError> {
            std::future::pending().await
        }
    }

    fn job() -> Job {
        Job::new(
            NewJob {
                tenant_id: TenantId::new(),
                user_id: UserId::new(),
                workflow_id: None,
                job_type: JobType::default(),
                priority: Priority::default(),
                input_location: "/uploads/call.wav".into(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn writes_transcript_under_tenant_outputs() {
        let root = tempfile::tempdir().unwrap();
        let transcript = json!({"text": "hello world", "segments": []});
        let handler = TranscriptionHandler::new(Arc::new(FixedTranscriber(transcript.clone())), root.path());
        let job = job();
        let bus = Arc::new(InMemoryStatusBus::new());
        let updates = bus.subscribe();

        let output = handler
            .handle(JobContext::new(job.clone(), CancellationToken::new(), bus))
            .await
            .unwrap();

        let path = PathBuf::from(&output.result_location);
        assert!(path.starts_with(output_dir(root.path(), job.tenant_id)));
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("transcription_"));
        assert!(file_name.ends_with(&format!("_{}.json", job.id)));

        let written: JsonValue = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, transcript);

        let (kind, mb) = output.usage[0];
        assert_eq!(kind, ResourceKind::Storage);
        assert!(mb > 0.0);
        assert_eq!(updates.drain().len(), 2);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_transcription() {
        let root = tempfile::tempdir().unwrap();
        let handler = TranscriptionHandler::new(Arc::new(StuckTranscriber), root.path());
        let token = CancellationToken::new();
        let ctx = JobContext::new(job(), token.clone(), Arc::new(InMemoryStatusBus::new()));

        let run = tokio::spawn(async move { handler.handle(ctx).await });
        token.cancel();
        assert_eq!(run.await.unwrap(), Err(HandlerError::Canceled));
    }

    #[tokio::test]
    async fn failing_command_fails_the_job() {
        let transcriber = CommandTranscriber::new("false", vec![]);
        let request = TranscriptionRequest {
            tenant_id: TenantId::new(),
            job_id: JobId::new(),
            input_location: "in.wav".into(),
        };
        assert!(matches!(
            transcriber.transcribe(&request).await,
            Err(TranscriberError::Exit { .. })
        ));
    }

    #[tokio::test]
    async fn plain_stdout_is_wrapped_as_text() {
        let transcriber = CommandTranscriber::from_command_line("echo").unwrap();
        let request = TranscriptionRequest {
            tenant_id: TenantId::new(),
            job_id: JobId::new(),
            input_location: "spoken words".into(),
        };
        assert_eq!(
            transcriber.transcribe(&request).await.unwrap(),
            json!({"text": "spoken words"})
        );
        assert!(CommandTranscriber::from_command_line("   ").is_none());
    }
}
