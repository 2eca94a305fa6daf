use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scribe_auth::{Identity, authorize_job_access};
use scribe_core::{Job, JobId};
use scribe_events::{JobUpdate, StatusPublisher, TenantScoped};

use super::protocol::{ClientMessage, ProtocolViolation, ServerMessage, parse_client_frame};
use crate::jobs::{JobError, JobStore};

/// Error code sent just before closing a connection over an unparseable frame.
pub const PROTOCOL_VIOLATION: &str = "protocol_violation";

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Outbound messages buffered per connection; overflow disconnects.
    pub send_buffer: usize,
    /// A connection that sends nothing for this long is dropped.
    pub keepalive_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            send_buffer: 64,
            keepalive_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A registered live connection. Drain `outbound` into the socket; when it
/// yields `None` the server has dropped the connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

#[derive(Debug)]
struct ConnectionEntry {
    identity: Identity,
    sender: mpsc::Sender<ServerMessage>,
    /// Subscribed jobs, with the `updated_at` of the last persisted state sent.
    delivered: HashMap<JobId, Option<DateTime<Utc>>>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_job: HashMap<JobId, HashSet<ConnectionId>>,
}

impl Registry {
    fn remove_connection(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        for job_id in entry.delivered.keys() {
            self.unlink(*job_id, id);
        }
        Some(entry)
    }

    fn unlink(&mut self, job_id: JobId, id: ConnectionId) {
        if let Some(subscribers) = self.by_job.get_mut(&job_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.by_job.remove(&job_id);
            }
        }
    }

    /// Non-blocking send; a full or closed channel drops the connection.
    fn send(&mut self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            return false;
        };
        match entry.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, "send buffer full, disconnecting");
                self.remove_connection(id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "connection gone, removing");
                self.remove_connection(id);
                false
            }
        }
    }

    /// Send a job update unless this connection already has that state (or a
    /// newer one).
    fn deliver(&mut self, id: ConnectionId, update: &JobUpdate) {
        let Some(entry) = self.connections.get_mut(&id) else {
            return;
        };
        if entry.identity.tenant_id != update.tenant_id() {
            return;
        }
        let Some(last) = entry.delivered.get_mut(&update.job_id) else {
            return;
        };

        let already_seen = last.is_some_and(|t| {
            if update.is_progress() {
                update.updated_at < t
            } else {
                update.updated_at <= t
            }
        });
        if already_seen {
            return;
        }
        if !update.is_progress() {
            *last = Some(update.updated_at);
        }
        self.send(id, ServerMessage::from(update));
    }
}

/// In-process registry of live connections and their job subscriptions.
///
/// ## Delivery
///
/// - Publishing never blocks: each connection has a bounded buffer and is
///   disconnected when it overflows
/// - Per connection and job, a persisted state is delivered at most once, and
///   never after a newer one; a late subscriber gets the current state once
/// - Subscriptions are authorized per request against the connection's fixed
///   identity (tenant, then owner-or-admin)
pub struct StatusFanout {
    registry: Mutex<Registry>,
    store: Arc<dyn JobStore>,
    config: FanoutConfig,
    next_id: AtomicU64,
}

impl StatusFanout {
    pub fn new(store: Arc<dyn JobStore>, config: FanoutConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            store,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, identity: Identity) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, outbound) = mpsc::channel(self.config.send_buffer.max(1));
        self.lock().connections.insert(
            id,
            ConnectionEntry {
                identity: identity.clone(),
                sender,
                delivered: HashMap::new(),
                last_seen: Instant::now(),
            },
        );
        debug!(connection = %id, tenant_id = %identity.tenant_id, "connection registered");
        Connection {
            id,
            identity,
            outbound,
        }
    }

    /// Drop a connection and all of its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove_connection(id);
        if let Some(entry) = &removed {
            debug!(connection = %id, subscriptions = entry.delivered.len(), "connection removed");
        }
        removed.is_some()
    }

    /// Record liveness for a connection.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Returns `Err` for a protocol violation: an error frame has been queued
    /// and the caller should close the connection.
    pub async fn handle_frame(&self, id: ConnectionId, frame: &str) -> Result<(), ProtocolViolation> {
        self.touch(id);
        match parse_client_frame(frame) {
            Ok(Ok(message)) => {
                self.handle_message(id, message).await;
                Ok(())
            }
            Ok(Err(reply)) => {
                self.send_to(id, reply);
                Ok(())
            }
            Err(violation) => {
                self.send_to(id, ServerMessage::error(PROTOCOL_VIOLATION, violation.0.clone()));
                Err(violation)
            }
        }
    }

    pub async fn handle_message(&self, id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { job_id } => {
                if let Err(err) = self.subscribe(id, job_id).await {
                    debug!(connection = %id, %job_id, error = %err, "subscribe rejected");
                    self.send_to(id, ServerMessage::error(err.kind(), err.to_string()));
                }
            }
            ClientMessage::Unsubscribe { job_id } => {
                self.unsubscribe(id, job_id);
            }
            ClientMessage::Ping => {
                self.send_to(id, ServerMessage::Pong);
            }
        }
    }

    /// Subscribe a connection to a job, acknowledge, and send its current state.
    pub async fn subscribe(&self, id: ConnectionId, job_id: JobId) -> Result<(), JobError> {
        let identity = self
            .identity_of(id)
            .ok_or_else(|| JobError::Unauthorized("connection is closed".to_string()))?;
        let job = self.load(&identity, job_id).await?;

        {
            let mut registry = self.lock();
            let Some(entry) = registry.connections.get_mut(&id) else {
                return Ok(());
            };
            entry.delivered.entry(job_id).or_insert(None);
            registry.by_job.entry(job_id).or_default().insert(id);
            registry.send(id, ServerMessage::Subscribed { job_id });
            registry.deliver(id, &JobUpdate::from_job(&job));
        }

        // A transition persisted between the read and the registration above
        // was published before this connection was listening.
        if !job.status.is_terminal() {
            let latest = self.load(&identity, job_id).await?;
            if latest.updated_at > job.updated_at {
                self.lock().deliver(id, &JobUpdate::from_job(&latest));
            }
        }
        Ok(())
    }

    /// Remove a subscription and acknowledge. Unknown subscriptions are a no-op.
    pub fn unsubscribe(&self, id: ConnectionId, job_id: JobId) -> bool {
        let mut registry = self.lock();
        let Some(entry) = registry.connections.get_mut(&id) else {
            return false;
        };
        let removed = entry.delivered.remove(&job_id).is_some();
        if removed {
            registry.unlink(job_id, id);
        }
        registry.send(id, ServerMessage::Unsubscribed { job_id });
        removed
    }

    /// Queue a message for one connection.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> bool {
        self.lock().send(id, message)
    }

    /// Drop connections silent for longer than the keep-alive timeout.
    pub fn reap_idle(&self, now: Instant) -> Vec<ConnectionId> {
        let mut registry = self.lock();
        let stale: Vec<ConnectionId> = registry
            .connections
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > self.config.keepalive_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            registry.remove_connection(*id);
        }
        drop(registry);

        if !stale.is_empty() {
            info!(count = stale.len(), "reaped silent connections");
        }
        stale
    }

    /// Periodically reap silent connections until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let fanout = Arc::clone(self);
        let period = (self.config.keepalive_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        fanout.reap_idle(Instant::now());
                    }
                }
            }
        })
    }

    /// Drop every connection (shutdown).
    pub fn close_all(&self) -> usize {
        let mut registry = self.lock();
        let count = registry.connections.len();
        registry.connections.clear();
        registry.by_job.clear();
        info!(count, "closed all live connections");
        count
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.lock().by_job.get(&job_id).map_or(0, HashSet::len)
    }

    fn identity_of(&self, id: ConnectionId) -> Option<Identity> {
        self.lock().connections.get(&id).map(|e| e.identity.clone())
    }

    async fn load(&self, identity: &Identity, job_id: JobId) -> Result<Job, JobError> {
        let job = self
            .store
            .get(identity.tenant_id, job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        authorize_job_access(identity, &job)?;
        Ok(job)
    }
}

impl core::fmt::Debug for StatusFanout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusFanout")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl StatusPublisher for StatusFanout {
    fn publish(&self, update: JobUpdate) {
        let mut registry = self.lock();
        let Some(subscribers) = registry.by_job.get(&update.job_id) else {
            return;
        };
        let subscribers: Vec<ConnectionId> = subscribers.iter().copied().collect();
        for id in subscribers {
            registry.deliver(id, &update);
        }
    }
}
