//! Periodic recovery of work whose owner went away.
//!
//! Claims on jobs that never left PENDING are handed back to the queue
//! (up to the delivery limit, then the job fails). RUNNING jobs whose row
//! has not been written for longer than the job time limit plus a grace
//! period are failed; they are never resumed.

use std::sync::Arc;
use std::time::Duration;

use a6hub_core::job_status::JobStatus;
use a6hub_core::types::DbId;
use a6hub_db::store::{JobQueue, JobStore};
use a6hub_events::ProgressPublisher;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;

/// Counts from one [`Reaper::sweep`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub released: Vec<DbId>,
    pub exhausted: Vec<DbId>,
    pub lost: Vec<DbId>,
    pub purged: u64,
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    publisher: ProgressPublisher,
    interval: Duration,
    claim_visibility: Duration,
    max_attempts: i32,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        publisher: ProgressPublisher,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            publisher,
            interval: config.reaper.interval,
            claim_visibility: config.reaper.claim_visibility,
            max_attempts: config.reaper.max_delivery_attempts,
            stale_after: config.stale_after(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            claim_visibility_secs = self.claim_visibility.as_secs(),
            stale_after_secs = self.stale_after.as_secs(),
            "Reaper started"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if report == SweepReport::default() {
                        tracing::debug!("Reaper: nothing to recover");
                    } else {
                        tracing::info!(?report, "Reaper sweep finished");
                    }
                }
            }
        }
    }

    /// One pass. Each step logs its own failure and the rest still run.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self
            .queue
            .release_stale(self.claim_visibility, self.max_attempts)
            .await
        {
            Ok(ids) => report.released = ids,
            Err(e) => tracing::error!(error = %e, "Reaper: releasing stale claims failed"),
        }

        match self
            .queue
            .take_exhausted(self.claim_visibility, self.max_attempts)
            .await
        {
            Ok(ids) => {
                let message = format!(
                    "Job was not started after {} delivery attempts",
                    self.max_attempts
                );
                for &job_id in &ids {
                    self.fail(job_id, &message).await;
                }
                report.exhausted = ids;
            }
            Err(e) => tracing::error!(error = %e, "Reaper: collecting exhausted claims failed"),
        }

        let message = format!(
            "Worker lost: no progress for {}s",
            self.stale_after.as_secs()
        );
        match self.store.fail_stale_running(self.stale_after, &message).await {
            Ok(ids) => {
                for &job_id in &ids {
                    tracing::warn!(job_id, "Reaper: failed orphaned running job");
                    self.announce_failure(job_id, &message).await;
                }
                report.lost = ids;
            }
            Err(e) => tracing::error!(error = %e, "Reaper: failing stale jobs failed"),
        }

        match self.queue.purge_terminal().await {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::error!(error = %e, "Reaper: purging queue failed"),
        }

        report
    }

    async fn fail(&self, job_id: DbId, message: &str) {
        match self.store.fail(job_id, message).await {
            Ok(true) => {
                tracing::warn!(job_id, "Reaper: delivery attempts exhausted");
                self.announce_failure(job_id, message).await;
            }
            Ok(false) => {}
            Err(e) => tracing::error!(job_id, error = %e, "Reaper: failing job failed"),
        }
    }

    async fn announce_failure(&self, job_id: DbId, message: &str) {
        self.publisher.error(job_id, message).await;
        self.publisher
            .complete(job_id, JobStatus::Failed, Some(message.to_string()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use a6hub_core::job_type::JobType;
    use a6hub_db::models::job::CreateJob;
    use a6hub_db::store::MemoryStore;
    use a6hub_events::LocalBus;

    use super::*;

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::from_lookup(|_| None).unwrap();
        config.max_job_duration = Duration::from_secs(600);
        config.reaper.stale_grace = Duration::from_secs(60);
        config.reaper.claim_visibility = Duration::from_secs(60);
        config.reaper.max_delivery_attempts = 2;
        config
    }

    async fn setup() -> (Arc<MemoryStore>, Reaper, DbId) {
        let store = Arc::new(MemoryStore::new());
        let project = store.insert_project(1, "private").await;
        let job = store
            .create_job(&CreateJob {
                job_type: JobType::Build,
                config: serde_json::json!({ "design_name": "r" }),
                project_id: project.id,
                user_id: 1,
            })
            .await
            .unwrap();
        let publisher = ProgressPublisher::new(Arc::new(LocalBus::default()));
        let reaper = Reaper::new(store.clone(), store.clone(), publisher, &config());
        (store, reaper, job.id)
    }

    #[tokio::test]
    async fn orphaned_claim_is_redelivered_then_failed() {
        let (store, reaper, id) = setup().await;
        store.enqueue(id, JobType::Build).await.unwrap();

        store.claim_next("dead-1", &[JobType::Build]).await.unwrap();
        store.backdate_claim(id, Duration::from_secs(120)).await;
        let report = reaper.sweep().await;
        assert_eq!(report.released, vec![id]);

        store.claim_next("dead-2", &[JobType::Build]).await.unwrap();
        store.backdate_claim(id, Duration::from_secs(120)).await;
        let report = reaper.sweep().await;
        assert!(report.released.is_empty());
        assert_eq!(report.exhausted, vec![id]);

        let job = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(
            job.error_message.as_deref(),
            Some("Job was not started after 2 delivery attempts")
        );
        assert!(store.queue_entries().await.is_empty());
    }

    #[tokio::test]
    async fn silent_running_job_is_failed_not_resumed() {
        let (store, reaper, id) = setup().await;
        store.mark_running(id, "dead").await.unwrap();
        assert_eq!(reaper.sweep().await, SweepReport::default());

        store.backdate_job(id, Duration::from_secs(3600)).await;
        let report = reaper.sweep().await;
        assert_eq!(report.lost, vec![id]);

        let job = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(
            job.error_message.as_deref(),
            Some("Worker lost: no progress for 660s")
        );
    }

    #[tokio::test]
    async fn finished_jobs_leave_the_queue() {
        let (store, reaper, id) = setup().await;
        store.enqueue(id, JobType::Build).await.unwrap();
        store.cancel(id).await.unwrap();
        assert_eq!(reaper.sweep().await.purged, 1);
    }
}
