//! Job lifecycle: storage, handlers, dispatch and admission.
//!
//! ## Components
//!
//! - `JobStore`: source of truth with atomic status transitions
//! - `HandlerRegistry`: routes a job type to its `JobHandler`
//! - `JobDispatcher`: runs one dequeued job to a terminal state
//! - `JobService`: caller-facing submit/get/list/cancel/retry
//! - `JobError`: the error taxonomy shared by all of the above

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod postgres;
pub mod service;
pub mod store;
pub mod transcription;

pub use dispatcher::{INTERNAL_ERROR_DETAIL, JobDispatcher};
pub use error::JobError;
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, JobOutput};
pub use postgres::PostgresJobStore;
pub use service::{INTERRUPTED_DETAIL, JobService, RecoveryReport, SubmitJob};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError};
pub use transcription::{CommandTranscriber, Transcriber, TranscriberError, TranscriptionHandler, TranscriptionRequest};
