//! Status publishing abstraction.
//!
//! The dispatcher persists every transition **before** publishing it, so a
//! publisher never needs to be durable: the job store is the source of truth
//! and a subscriber can always read back what it was told.
//!
//! ## Delivery
//!
//! - Fire-and-forget: `publish()` never blocks on slow consumers and never fails
//!   the caller
//! - Per job, updates are published in transition order
//! - Consumers must tolerate duplicates (a subscriber may see the same state
//!   from a snapshot and from a publish)

use std::sync::Arc;
use std::sync::mpsc::Receiver;

use crate::JobUpdate;

/// A subscription to a status stream.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Sink for job status updates.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, update: JobUpdate);
}

impl<P> StatusPublisher for Arc<P>
where
    P: StatusPublisher + ?Sized,
{
    fn publish(&self, update: JobUpdate) {
        (**self).publish(update)
    }
}
