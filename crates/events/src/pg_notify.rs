//! Cross-process bus over Postgres `LISTEN`/`NOTIFY`.
//!
//! Each job has its own channel (see [`channel_name`]). Postgres delivers
//! notifications from one session in commit order, which gives per-job
//! producer ordering since a job has one writer.
//!
//! All subscriptions of one bus share a single listener connection. A relay
//! task owns it, `LISTEN`s on a job's channel when the first subscriber for
//! that job arrives and `UNLISTEN`s when the last one goes away.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use a6hub_core::job_events::JobUpdate;
use a6hub_core::types::DbId;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc, oneshot, OnceCell};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::bus::{channel_name, BusError, UpdateBus, UpdateStream};
use crate::payload::{shrink_to_fit, MAX_PAYLOAD_BYTES};

/// Per-job buffer between the relay task and slow subscribers.
const JOB_CHANNEL_CAPACITY: usize = 256;

/// Pause after a listener error before polling it again.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct PgNotifyBus {
    pool: PgPool,
    relay: OnceCell<mpsc::UnboundedSender<RelayCommand>>,
}

impl PgNotifyBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            relay: OnceCell::new(),
        }
    }

    /// The relay task is started by the first subscription.
    async fn relay(&self) -> Result<&mpsc::UnboundedSender<RelayCommand>, BusError> {
        self.relay
            .get_or_try_init(|| async {
                let listener = PgListener::connect_with(&self.pool).await?;
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_relay(listener, rx));
                tracing::info!("Started job update listener");
                Ok::<_, BusError>(tx)
            })
            .await
    }
}

#[async_trait]
impl UpdateBus for PgNotifyBus {
    /// Oversized updates are cut to fit the `NOTIFY` limit. Only an update
    /// that still does not fit is dropped.
    async fn publish(&self, update: &JobUpdate) -> Result<(), BusError> {
        let mut payload = serde_json::to_string(update)?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            let mut shrunk = update.clone();
            if !shrink_to_fit(&mut shrunk, MAX_PAYLOAD_BYTES)? {
                tracing::warn!(
                    job_id = update.job_id,
                    kind = update.type_name(),
                    bytes = payload.len(),
                    "Update exceeds NOTIFY payload limit, dropped"
                );
                return Ok(());
            }
            payload = serde_json::to_string(&shrunk)?;
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel_name(update.job_id))
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, job_id: DbId) -> Result<UpdateStream, BusError> {
        let relay = self.relay().await?;
        let (reply, receiver) = oneshot::channel();
        relay
            .send(RelayCommand::Subscribe { job_id, reply })
            .map_err(|_| BusError::Closed)?;
        let updates = receiver.await.map_err(|_| BusError::Closed)??;

        Ok(Subscription {
            job_id,
            updates: BroadcastStream::new(updates),
            _release: Release {
                job_id,
                relay: relay.clone(),
            },
        }
        .boxed())
    }
}

// ---------------------------------------------------------------------------
// Relay task
// ---------------------------------------------------------------------------

enum RelayCommand {
    Subscribe {
        job_id: DbId,
        reply: oneshot::Sender<Result<broadcast::Receiver<JobUpdate>, BusError>>,
    },
    Release {
        job_id: DbId,
    },
}

/// Runs until the bus and every subscription are gone.
async fn run_relay(mut listener: PgListener, mut commands: mpsc::UnboundedReceiver<RelayCommand>) {
    let mut jobs: HashMap<DbId, broadcast::Sender<JobUpdate>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RelayCommand::Subscribe { job_id, reply }) => {
                    let result = match jobs.get(&job_id) {
                        Some(sender) => Ok(sender.subscribe()),
                        None => match listener.listen(&channel_name(job_id)).await {
                            Ok(()) => {
                                let (sender, receiver) = broadcast::channel(JOB_CHANNEL_CAPACITY);
                                jobs.insert(job_id, sender);
                                tracing::debug!(job_id, "Listening for job updates");
                                Ok(receiver)
                            }
                            Err(e) => Err(BusError::Database(e)),
                        },
                    };
                    let _ = reply.send(result);
                }
                Some(RelayCommand::Release { job_id }) => {
                    if jobs.get(&job_id).is_some_and(|s| s.receiver_count() == 0) {
                        jobs.remove(&job_id);
                        if let Err(e) = listener.unlisten(&channel_name(job_id)).await {
                            tracing::warn!(job_id, error = %e, "Failed to stop listening for job updates");
                        } else {
                            tracing::debug!(job_id, "Stopped listening for job updates");
                        }
                    }
                }
                None => break,
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    match serde_json::from_str::<JobUpdate>(notification.payload()) {
                        Ok(update) => {
                            if let Some(sender) = jobs.get(&update.job_id) {
                                let _ = sender.send(update);
                            }
                        }
                        Err(e) => tracing::warn!(
                            channel = notification.channel(),
                            error = %e,
                            "Malformed job update notification"
                        ),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "PgListener error");
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                }
            },
        }
    }
    tracing::info!("Job update listener stopped");
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct Subscription {
    job_id: DbId,
    updates: BroadcastStream<JobUpdate>,
    /// Declared after `updates` so the receiver is gone when the relay
    /// handles the release.
    _release: Release,
}

impl Stream for Subscription {
    type Item = JobUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobUpdate>> {
        loop {
            match ready!(self.updates.poll_next_unpin(cx)) {
                Some(Ok(update)) => return Poll::Ready(Some(update)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(job_id = self.job_id, skipped, "Job update subscriber lagged");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

struct Release {
    job_id: DbId,
    relay: mpsc::UnboundedSender<RelayCommand>,
}

impl Drop for Release {
    fn drop(&mut self) {
        let _ = self.relay.send(RelayCommand::Release {
            job_id: self.job_id,
        });
    }
}
