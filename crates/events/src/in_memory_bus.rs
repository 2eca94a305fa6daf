//! In-memory status bus for tests/dev.

use std::sync::{Mutex, mpsc};

use crate::bus::{StatusPublisher, Subscription};
use crate::JobUpdate;

/// In-memory pub/sub for status updates.
///
/// - No IO / no async
/// - Best-effort fan-out; dropped subscriptions are pruned on publish
#[derive(Debug, Default)]
pub struct InMemoryStatusBus {
    subscribers: Mutex<Vec<mpsc::Sender<JobUpdate>>>,
}

impl InMemoryStatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<JobUpdate> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just won't receive.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

impl StatusPublisher for InMemoryStatusBus {
    fn publish(&self, update: JobUpdate) {
        let Ok(mut subs) = self.subscribers.lock() else {
            tracing::warn!(job_id = %update.job_id, "status bus lock poisoned; update dropped");
            return;
        };

        subs.retain(|tx| tx.send(update.clone()).is_ok());
    }
}
