//! Tenant-partitioned job queues.
//!
//! The queue holds job references only; the job store remains the source of
//! truth for status. A job taken from a queue may already have been canceled,
//! which the runner detects when it tries to start it.

pub mod set;
pub mod tenant_queue;

pub use set::{JobRunner, QueueConfig, QueueError, TenantQueueSet};
pub use tenant_queue::QueuedJob;
