//! The [`UpdateBus`] seam and the in-process [`LocalBus`].

use a6hub_core::job_events::JobUpdate;
use a6hub_core::types::DbId;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Stream of updates for one job, in producer order.
pub type UpdateStream = BoxStream<'static, JobUpdate>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bus payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Bus listener has stopped")]
    Closed,
}

/// Channel carrying updates for `job_id`.
pub fn channel_name(job_id: DbId) -> String {
    format!("job_updates_{job_id}")
}

/// Broadcast channel decoupling the producing worker from API relayers.
///
/// Updates for one job are delivered to each subscriber in publish order.
/// Nothing is retained for subscribers that join later.
#[async_trait]
pub trait UpdateBus: Send + Sync {
    async fn publish(&self, update: &JobUpdate) -> Result<(), BusError>;

    async fn subscribe(&self, job_id: DbId) -> Result<UpdateStream, BusError>;
}

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process bus for single-process deployments and tests.
///
/// One broadcast channel carries every job; subscribers filter by job id.
/// A subscriber that falls more than the channel capacity behind skips the
/// missed updates.
pub struct LocalBus {
    sender: broadcast::Sender<JobUpdate>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Number of live subscriptions across all jobs.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl UpdateBus for LocalBus {
    async fn publish(&self, update: &JobUpdate) -> Result<(), BusError> {
        // A send error only means nobody is subscribed.
        let _ = self.sender.send(update.clone());
        Ok(())
    }

    async fn subscribe(&self, job_id: DbId) -> Result<UpdateStream, BusError> {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| async move {
            match item {
                Ok(update) if update.job_id == job_id => Some(update),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id, skipped, "Local bus subscriber lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
