//! `scribe-core`: domain foundation for the job-processing core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job state machine, usage records and status fingerprints.

pub mod error;
pub mod fingerprint;
pub mod id;
pub mod job;
pub mod usage;

pub use error::{DomainError, DomainResult};
pub use fingerprint::Fingerprint;
pub use id::{JobId, TenantId, UserId, WorkflowId};
pub use job::{Job, JobStatus, JobType, NewJob, Priority, Transition};
pub use usage::{ResourceKind, UsageRecord, UsageUnit};
