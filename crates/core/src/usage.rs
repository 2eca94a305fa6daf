//! Resource usage records (append-only, one set per completed job).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{JobId, TenantId, UserId};
use crate::job::Job;

/// Kind of metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Wall-clock handler time.
    Processing,
    /// Size of produced results.
    Storage,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Processing => "processing",
            ResourceKind::Storage => "storage",
        }
    }

    pub fn unit(&self) -> UsageUnit {
        match self {
            ResourceKind::Processing => UsageUnit::Seconds,
            ResourceKind::Storage => UsageUnit::Megabytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageUnit {
    #[serde(rename = "seconds")]
    Seconds,
    #[serde(rename = "MB")]
    Megabytes,
}

impl UsageUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageUnit::Seconds => "seconds",
            UsageUnit::Megabytes => "MB",
        }
    }
}

/// A single metered amount attributed to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub kind: ResourceKind,
    pub amount: f64,
    pub unit: UsageUnit,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn for_job(job: &Job, kind: ResourceKind, amount: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            tenant_id: job.tenant_id,
            user_id: job.user_id,
            job_id: job.id,
            kind,
            amount,
            unit: kind.unit(),
            recorded_at,
        }
    }
}
