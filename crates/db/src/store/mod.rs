//! Storage seams used by the pipeline, worker and API.
//!
//! [`JobStore`] covers job rows (and the project lookup the API needs for
//! access checks); [`JobQueue`] covers the claimable work queue. Both are
//! implemented over Postgres by [`PgStore`] and in memory by
//! [`MemoryStore`], which applies the same status guards as the SQL.

use std::time::Duration;

use a6hub_core::error::CoreError;
use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::progress::ProgressData;
use a6hub_core::types::DbId;
use async_trait::async_trait;

use crate::models::job::{CreateJob, Job};
use crate::models::project::Project;
use crate::models::queue::QueueEntry;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Confirm the backing store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn create_job(&self, input: &CreateJob) -> StoreResult<Job>;

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>>;

    async fn find_project(&self, id: DbId) -> StoreResult<Option<Project>>;

    /// A project's jobs, newest first. Logs are left out.
    async fn list_project_jobs(&self, project_id: DbId) -> StoreResult<Vec<Job>>;

    /// The project's most recently created job of `job_type`.
    async fn latest_job(&self, project_id: DbId, job_type: JobType) -> StoreResult<Option<Job>>;

    /// Paths of a project's stored files, ordered.
    async fn project_file_paths(&self, project_id: DbId) -> StoreResult<Vec<String>>;

    async fn job_status(&self, id: DbId) -> StoreResult<Option<JobStatus>>;

    /// PENDING/RUNNING -> RUNNING owned by `worker_id`. `None` if terminal.
    async fn mark_running(&self, id: DbId, worker_id: &str) -> StoreResult<Option<Job>>;

    /// Append-only log write.
    async fn append_logs(&self, id: DbId, chunk: &str) -> StoreResult<()>;

    /// Upsert progress for a RUNNING job; lower percentages are dropped.
    async fn update_progress(&self, id: DbId, data: &ProgressData) -> StoreResult<bool>;

    async fn complete(&self, id: DbId, artifacts_path: &str, data: &ProgressData)
        -> StoreResult<bool>;

    async fn fail(&self, id: DbId, error: &str) -> StoreResult<bool>;

    /// Returns `false` for a job that is already terminal.
    async fn cancel(&self, id: DbId) -> StoreResult<bool>;

    /// Fail RUNNING jobs with no write for longer than `max_age`.
    async fn fail_stale_running(&self, max_age: Duration, error: &str) -> StoreResult<Vec<DbId>>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create a PENDING job and its queue entry as one write. Nothing is
    /// kept if either part fails.
    async fn submit(&self, input: &CreateJob) -> StoreResult<Job>;

    /// At most one entry per job; returns `false` if already enqueued.
    async fn enqueue(&self, job_id: DbId, job_type: JobType) -> StoreResult<bool>;

    async fn claim_next(&self, worker_id: &str, queues: &[JobType])
        -> StoreResult<Option<QueueEntry>>;

    async fn remove(&self, job_id: DbId) -> StoreResult<()>;

    /// Unclaim entries whose job is still PENDING after `visibility` and
    /// has fewer than `max_attempts` deliveries.
    async fn release_stale(&self, visibility: Duration, max_attempts: i32)
        -> StoreResult<Vec<DbId>>;

    /// Remove stale PENDING claims that are out of deliveries.
    async fn take_exhausted(&self, visibility: Duration, max_attempts: i32)
        -> StoreResult<Vec<DbId>>;

    async fn purge_terminal(&self) -> StoreResult<u64>;
}
