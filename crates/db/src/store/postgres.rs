use std::time::Duration;

use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::progress::ProgressData;
use a6hub_core::types::DbId;
use async_trait::async_trait;
use sqlx::PgPool;

use super::{JobQueue, JobStore, StoreResult};
use crate::models::job::{CreateJob, Job};
use crate::models::project::Project;
use crate::models::queue::QueueEntry;
use crate::repositories::{JobRepo, ProjectFileRepo, ProjectRepo, QueueRepo};

/// Postgres-backed store delegating to the repositories.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(crate::health_check(&self.pool).await?)
    }

    async fn create_job(&self, input: &CreateJob) -> StoreResult<Job> {
        Ok(JobRepo::create(&self.pool, input).await?)
    }

    async fn find_job(&self, id: DbId) -> StoreResult<Option<Job>> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_project(&self, id: DbId) -> StoreResult<Option<Project>> {
        Ok(ProjectRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_project_jobs(&self, project_id: DbId) -> StoreResult<Vec<Job>> {
        Ok(JobRepo::list_by_project(&self.pool, project_id).await?)
    }

    async fn latest_job(&self, project_id: DbId, job_type: JobType) -> StoreResult<Option<Job>> {
        Ok(JobRepo::latest_by_type(&self.pool, project_id, job_type.as_str()).await?)
    }

    async fn project_file_paths(&self, project_id: DbId) -> StoreResult<Vec<String>> {
        let files = ProjectFileRepo::list_by_project(&self.pool, project_id).await?;
        Ok(files.into_iter().map(|f| f.filepath).collect())
    }

    async fn job_status(&self, id: DbId) -> StoreResult<Option<JobStatus>> {
        let id = JobRepo::status_id(&self.pool, id).await?;
        Ok(id.and_then(JobStatus::from_id))
    }

    async fn mark_running(&self, id: DbId, worker_id: &str) -> StoreResult<Option<Job>> {
        Ok(JobRepo::mark_running(&self.pool, id, worker_id).await?)
    }

    async fn append_logs(&self, id: DbId, chunk: &str) -> StoreResult<()> {
        Ok(JobRepo::append_logs(&self.pool, id, chunk).await?)
    }

    async fn update_progress(&self, id: DbId, data: &ProgressData) -> StoreResult<bool> {
        Ok(JobRepo::update_progress(&self.pool, id, data).await?)
    }

    async fn complete(
        &self,
        id: DbId,
        artifacts_path: &str,
        data: &ProgressData,
    ) -> StoreResult<bool> {
        Ok(JobRepo::complete(&self.pool, id, artifacts_path, data).await?)
    }

    async fn fail(&self, id: DbId, error: &str) -> StoreResult<bool> {
        Ok(JobRepo::fail(&self.pool, id, error).await?)
    }

    async fn cancel(&self, id: DbId) -> StoreResult<bool> {
        Ok(JobRepo::cancel(&self.pool, id).await?)
    }

    async fn fail_stale_running(&self, max_age: Duration, error: &str) -> StoreResult<Vec<DbId>> {
        Ok(JobRepo::fail_stale_running(&self.pool, max_age.as_secs_f64(), error).await?)
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn submit(&self, input: &CreateJob) -> StoreResult<Job> {
        Ok(JobRepo::create_enqueued(&self.pool, input).await?)
    }

    async fn enqueue(&self, job_id: DbId, job_type: JobType) -> StoreResult<bool> {
        Ok(QueueRepo::enqueue(&self.pool, job_id, job_type.as_str()).await?)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        queues: &[JobType],
    ) -> StoreResult<Option<QueueEntry>> {
        let names: Vec<String> = queues.iter().map(|q| q.as_str().to_string()).collect();
        Ok(QueueRepo::claim_next(&self.pool, worker_id, &names).await?)
    }

    async fn remove(&self, job_id: DbId) -> StoreResult<()> {
        Ok(QueueRepo::remove(&self.pool, job_id).await?)
    }

    async fn release_stale(
        &self,
        visibility: Duration,
        max_attempts: i32,
    ) -> StoreResult<Vec<DbId>> {
        Ok(QueueRepo::release_stale(&self.pool, visibility.as_secs_f64(), max_attempts).await?)
    }

    async fn take_exhausted(
        &self,
        visibility: Duration,
        max_attempts: i32,
    ) -> StoreResult<Vec<DbId>> {
        Ok(QueueRepo::take_exhausted(&self.pool, visibility.as_secs_f64(), max_attempts).await?)
    }

    async fn purge_terminal(&self) -> StoreResult<u64> {
        Ok(QueueRepo::purge_terminal(&self.pool).await?)
    }
}
