//! Queue dispatcher.
//!
//! Polls the job queue every `poll_interval` and hands claimed jobs to the
//! [`BuildDriver`], at most `concurrency` at a time. Claims go through
//! [`JobQueue::claim_next`] (`FOR UPDATE SKIP LOCKED` in Postgres), so a
//! queued job has a single owner.

use std::sync::Arc;
use std::time::Duration;

use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::types::DbId;
use a6hub_db::store::{JobQueue, JobStore};
use a6hub_events::ProgressPublisher;
use a6hub_pipeline::{BuildDriver, DriveOutcome};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkerConfig;

pub struct Dispatcher {
    inner: Arc<Inner>,
    slots: Arc<Semaphore>,
    poll_interval: Duration,
    queues: Vec<JobType>,
}

/// State shared with the per-job tasks.
struct Inner {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn JobStore>,
    driver: BuildDriver,
    publisher: ProgressPublisher,
    worker_id: String,
    dispatch_limit: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn JobStore>,
        driver: BuildDriver,
        publisher: ProgressPublisher,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                store,
                driver,
                publisher,
                worker_id: config.worker_id.clone(),
                dispatch_limit: config.dispatch_limit(),
            }),
            slots: Arc::new(Semaphore::new(config.concurrency)),
            poll_interval: config.poll_interval,
            queues: config.queues.clone(),
        }
    }

    /// Run the dispatcher loop until `cancel` is triggered, then wait for
    /// in-flight jobs to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let tasks = TaskTracker::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            worker_id = %self.inner.worker_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            slots = self.slots.available_permits(),
            "Job dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.dispatch_once(&tasks).await;
                }
            }
        }

        tasks.close();
        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Waiting for running jobs");
        }
        tasks.wait().await;
    }

    /// Claim jobs while there are free slots. Returns how many were claimed.
    pub async fn dispatch_once(&self, tasks: &TaskTracker) -> usize {
        let mut claimed = 0;
        loop {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let entry = match self
                .inner
                .queue
                .claim_next(&self.inner.worker_id, &self.queues)
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Queue claim failed");
                    break;
                }
            };

            tracing::info!(
                job_id = entry.job_id,
                queue = %entry.queue,
                attempt = entry.attempts,
                "Job claimed",
            );
            claimed += 1;

            let inner = self.inner.clone();
            tasks.spawn(async move {
                inner.execute(entry.job_id).await;
                drop(permit);
            });
        }
        claimed
    }

    /// Drive one job under the outer time limit and settle its queue entry.
    pub async fn execute(&self, job_id: DbId) -> DriveOutcome {
        self.inner.execute(job_id).await
    }
}

impl Inner {
    async fn execute(&self, job_id: DbId) -> DriveOutcome {
        let outcome = match tokio::time::timeout(self.dispatch_limit, self.driver.drive(job_id)).await
        {
            Ok(outcome) => outcome,
            Err(_) => self.fail_overdue(job_id).await,
        };

        match &outcome {
            DriveOutcome::Deferred(reason) => {
                tracing::warn!(job_id, %reason, "Job deferred, claim left for redelivery");
            }
            _ => {
                if let Err(e) = self.queue.remove(job_id).await {
                    tracing::error!(job_id, error = %e, "Failed to remove queue entry");
                }
            }
        }
        tracing::info!(job_id, ?outcome, "Job dispatch finished");
        outcome
    }

    /// The driver overran its own deadline. Dropping its future killed the
    /// child processes; the job row still has to be closed.
    async fn fail_overdue(&self, job_id: DbId) -> DriveOutcome {
        let message = format!(
            "Job exceeded dispatcher time limit of {}s",
            self.dispatch_limit.as_secs()
        );
        tracing::error!(job_id, "Driver overran dispatcher time limit");

        match self.store.fail(job_id, &message).await {
            Ok(true) => {
                self.publisher.error(job_id, &message).await;
                self.publisher
                    .complete(job_id, JobStatus::Failed, Some(message.clone()))
                    .await;
            }
            Ok(false) => {}
            Err(e) => tracing::error!(job_id, error = %e, "Failed to record dispatcher timeout"),
        }
        DriveOutcome::Failed(message)
    }
}
