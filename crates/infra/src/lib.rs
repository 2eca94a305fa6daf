//! Infrastructure layer: job storage, metering, tenant queues, dispatch and
//! status delivery.

pub mod fanout;
pub mod jobs;
pub mod ledger;
pub mod policy;
pub mod queue;
pub mod snapshot;
pub mod system;

pub use fanout::{FanoutConfig, StatusFanout};
pub use jobs::{JobDispatcher, JobError, JobService, JobStore};
pub use ledger::ResourceLedger;
pub use policy::{StaticTenantPolicy, TenantLimits, TenantPolicy, TenantQuota};
pub use queue::{QueueConfig, TenantQueueSet};
pub use snapshot::{JobStatusView, StatusSnapshot, StatusSnapshotService};
pub use system::{JobSystem, JobSystemConfig};
