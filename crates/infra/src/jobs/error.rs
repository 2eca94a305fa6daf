//! Error taxonomy shared by admission, dispatch and status delivery.

use scribe_auth::AuthzError;
use scribe_core::{DomainError, JobId};

use super::store::JobStoreError;
use crate::ledger::LedgerError;
use crate::queue::QueueError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Tenant queue ceiling or usage quota reached.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Wrong tenant, or not the owner and not an admin.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A handler reported failure (or none is registered for the job type).
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Unexpected crash or storage failure.
    #[error("internal fault: {0}")]
    InternalFault(String),
}

impl JobError {
    /// Stable machine-readable code.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::CapacityExceeded(_) => "capacity_exceeded",
            JobError::NotFound(_) => "not_found",
            JobError::Unauthorized(_) => "unauthorized",
            JobError::Validation(_) => "validation",
            JobError::InvalidTransition { .. } => "invalid_transition",
            JobError::HandlerFailure(_) => "handler_failure",
            JobError::InternalFault(_) => "internal_fault",
        }
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            JobStoreError::TenantIsolation => {
                JobError::Unauthorized("job belongs to another tenant".to_string())
            }
            JobStoreError::Transition { source, .. } => source.into(),
            JobStoreError::AlreadyExists(_) | JobStoreError::Storage(_) => {
                JobError::InternalFault(err.to_string())
            }
        }
    }
}

impl From<DomainError> for JobError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobError::Validation(msg),
            DomainError::InvalidTransition { from, to } => JobError::InvalidTransition { from, to },
        }
    }
}

impl From<AuthzError> for JobError {
    fn from(err: AuthzError) -> Self {
        JobError::Unauthorized(err.to_string())
    }
}

impl From<LedgerError> for JobError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::QuotaExceeded { .. } => JobError::CapacityExceeded(err.to_string()),
            LedgerError::MixedTenants | LedgerError::Storage(_) => JobError::InternalFault(err.to_string()),
        }
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CapacityExceeded { .. } => JobError::CapacityExceeded(err.to_string()),
            QueueError::ShuttingDown => JobError::InternalFault(err.to_string()),
        }
    }
}
