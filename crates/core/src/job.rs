//! Job record and its status state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! queued ──► processing ──► completed
//!   │            │    └───► failed
//!   └────────────┴────────► canceled
//! ```
//!
//! Transitions are monotonic: a terminal status (`completed`, `failed`,
//! `canceled`) is never left. Every applied transition strictly advances
//! `updated_at`, which keeps status fingerprints unique per state.

use core::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::fingerprint::Fingerprint;
use crate::id::{JobId, TenantId, UserId, WorkflowId};

/// Error detail stored on jobs that end in `canceled`.
pub const CANCELED_DETAIL: &str = "job canceled";

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting in the tenant queue
    Queued,
    /// Picked up by a worker loop
    Processing,
    /// Handler succeeded; result location is set
    Completed,
    /// Handler failed or crashed; error detail is set
    Failed,
    /// Canceled by an explicit request
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Queued, Canceled)
                | (Processing, Canceled)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Declared job type, used to route a job to its handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    pub const TRANSCRIPTION: &'static str = "transcription";

    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn transcription() -> Self {
        Self(Self::TRANSCRIPTION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobType {
    fn default() -> Self {
        Self::transcription()
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduling priority; lower values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(10);

    pub fn new(value: i64) -> DomainResult<Self> {
        if value < i64::from(Self::HIGHEST.0) || value > i64::from(Self::LOWEST.0) {
            return Err(DomainError::validation(format!(
                "priority must be between {} and {}",
                Self::HIGHEST.0,
                Self::LOWEST.0
            )));
        }
        Ok(Self(value as u8))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::HIGHEST
    }
}

/// Input for creating a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workflow_id: Option<WorkflowId>,
    pub job_type: JobType,
    pub priority: Priority,
    pub input_location: String,
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start,
    Complete { result_location: String },
    Fail { error: String },
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Start => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Cancel => JobStatus::Canceled,
        }
    }
}

/// A unit of asynchronous work tracked through its status lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub workflow_id: Option<WorkflowId>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: Priority,
    pub input_location: String,
    /// Set only once the job is `completed`.
    pub result_location: Option<String>,
    /// Set only once the job is `failed` or `canceled`.
    pub error: Option<String>,
    /// The job this one retries, if it was created by an explicit retry.
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a `queued` job record.
    pub fn new(new: NewJob, now: DateTime<Utc>) -> DomainResult<Self> {
        if new.input_location.trim().is_empty() {
            return Err(DomainError::validation("input location must not be empty"));
        }

        let now = now.trunc_subsecs(6);
        Ok(Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            user_id: new.user_id,
            workflow_id: new.workflow_id,
            job_type: new.job_type,
            status: JobStatus::Queued,
            priority: new.priority,
            input_location: new.input_location,
            result_location: None,
            error: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// Apply a transition, enforcing the state machine.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> DomainResult<()> {
        let target = transition.target();
        if !self.status.can_transition_to(target) {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                target.as_str(),
            ));
        }

        match transition {
            Transition::Start => {}
            Transition::Complete { result_location } => {
                if result_location.trim().is_empty() {
                    return Err(DomainError::validation("result location must not be empty"));
                }
                self.result_location = Some(result_location);
            }
            Transition::Fail { error } => {
                self.error = Some(error);
            }
            Transition::Cancel => {
                self.error = Some(CANCELED_DETAIL.to_string());
            }
        }

        self.status = target;
        self.updated_at = next_timestamp(self.updated_at, now);
        if target.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Create the successor attempt for an explicit retry.
    ///
    /// The original record keeps its terminal state.
    pub fn successor(&self, now: DateTime<Utc>) -> DomainResult<Job> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::Canceled) {
            return Err(DomainError::invalid_transition(
                self.status.as_str(),
                JobStatus::Queued.as_str(),
            ));
        }

        let mut next = Job::new(
            NewJob {
                tenant_id: self.tenant_id,
                user_id: self.user_id,
                workflow_id: self.workflow_id,
                job_type: self.job_type.clone(),
                priority: self.priority,
                input_location: self.input_location.clone(),
            },
            now,
        )?;
        next.retry_of = Some(self.id);
        Ok(next)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.status, self.updated_at)
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }
}

/// Timestamps are kept at microsecond precision (what relational stores keep)
/// and strictly increase across transitions.
fn next_timestamp(prev: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    if now > prev {
        now
    } else {
        prev + Duration::microseconds(1)
    }
}
