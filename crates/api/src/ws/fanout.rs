use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use a6hub_core::types::DbId;
use a6hub_events::{UpdateBus, UpdateStream};
use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Subscribers of one job and the task relaying its bus updates.
struct JobChannel {
    connections: HashMap<String, WsSender>,
    relay: JoinHandle<()>,
}

type Registry = Arc<RwLock<HashMap<DbId, JobChannel>>>;

/// Relays bus updates to the WebSocket connections subscribed to each job.
///
/// One bus subscription and one relay task exist per job with at least one
/// subscriber. Each update is serialized once and pushed to every
/// connection of that job in bus order.
pub struct JobFanout {
    bus: Arc<dyn UpdateBus>,
    jobs: Registry,
}

impl JobFanout {
    pub fn new(bus: Arc<dyn UpdateBus>) -> Self {
        Self {
            bus,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `conn_id` as a subscriber of `job_id`.
    ///
    /// Returns the receiver the connection forwards to its socket. If the
    /// bus subscription cannot be opened the receiver is already closed and
    /// the connection only gets what the handler sends itself.
    pub async fn join(&self, job_id: DbId, conn_id: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(channel) = self.jobs.write().await.get_mut(&job_id) {
            channel.connections.insert(conn_id, tx);
            return rx;
        }

        // First subscriber. Subscribe without holding the registry lock.
        let updates = match self.bus.subscribe(job_id).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::error!(job_id, conn_id = %conn_id, error = %e, "Bus subscription failed");
                return rx;
            }
        };

        let mut jobs = self.jobs.write().await;
        match jobs.entry(job_id) {
            // Another connection opened the relay meanwhile; ours is dropped.
            Entry::Occupied(mut entry) => {
                entry.get_mut().connections.insert(conn_id, tx);
            }
            Entry::Vacant(entry) => {
                let relay = tokio::spawn(relay(Arc::clone(&self.jobs), job_id, updates));
                tracing::debug!(job_id, "Job relay started");
                entry.insert(JobChannel {
                    connections: HashMap::from([(conn_id, tx)]),
                    relay,
                });
            }
        }
        rx
    }

    /// Unregister a connection. The last one out stops the relay and
    /// releases the bus subscription.
    pub async fn leave(&self, job_id: DbId, conn_id: &str) {
        let mut jobs = self.jobs.write().await;
        let Some(channel) = jobs.get_mut(&job_id) else {
            return;
        };
        channel.connections.remove(conn_id);
        if channel.connections.is_empty() {
            if let Some(channel) = jobs.remove(&job_id) {
                channel.relay.abort();
                tracing::debug!(job_id, "Last subscriber left, job relay stopped");
            }
        }
    }

    /// Number of connections across all jobs.
    pub async fn connection_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .map(|c| c.connections.len())
            .sum()
    }

    /// Number of jobs with a running relay.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn subscriber_count(&self, job_id: DbId) -> usize {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map_or(0, |c| c.connections.len())
    }

    /// Send a Ping frame to every connection.
    pub async fn ping_all(&self) {
        let jobs = self.jobs.read().await;
        for channel in jobs.values() {
            for sender in channel.connections.values() {
                let _ = sender.send(Message::Ping(Bytes::new()));
            }
        }
    }

    /// Send a Close frame to every connection, stop all relays and clear
    /// the registry.
    pub async fn shutdown_all(&self) {
        let mut jobs = self.jobs.write().await;
        let count: usize = jobs.values().map(|c| c.connections.len()).sum();
        for (_, channel) in jobs.drain() {
            for sender in channel.connections.values() {
                let _ = sender.send(Message::Close(None));
            }
            channel.relay.abort();
        }
        tracing::info!(count, "All job subscribers closed");
    }
}

/// Push every update for `job_id` to its current subscribers.
async fn relay(jobs: Registry, job_id: DbId, mut updates: UpdateStream) {
    while let Some(update) = updates.next().await {
        let text = match serde_json::to_string(&update) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to encode job update");
                continue;
            }
        };
        let message = Message::Text(text.into());

        let closed: Vec<String> = {
            let jobs = jobs.read().await;
            let Some(channel) = jobs.get(&job_id) else {
                return;
            };
            channel
                .connections
                .iter()
                .filter(|(_, sender)| sender.send(message.clone()).is_err())
                .map(|(conn_id, _)| conn_id.clone())
                .collect()
        };

        if !closed.is_empty() {
            let mut jobs = jobs.write().await;
            let Some(channel) = jobs.get_mut(&job_id) else {
                return;
            };
            for conn_id in &closed {
                tracing::debug!(job_id, conn_id = %conn_id, "Dropping closed subscriber");
                channel.connections.remove(conn_id);
            }
            if channel.connections.is_empty() {
                jobs.remove(&job_id);
                tracing::debug!(job_id, "No subscribers left, job relay stopped");
                return;
            }
        }
    }

    tracing::warn!(job_id, "Bus subscription ended, dropping job subscribers");
    jobs.write().await.remove(&job_id);
}
