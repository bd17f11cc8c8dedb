//! Repository for the `jobs` table.
//!
//! Every status write carries a `status_id` predicate mirroring
//! [`JobStatus::can_transition_to`], so a stale writer cannot move a job
//! out of a terminal state. Every write also bumps `updated_at`, which the
//! reaper reads as the job's liveness signal.

use a6hub_core::job_status::{JobStatus, StatusId, ACTIVE_STATUSES};
use a6hub_core::progress::ProgressData;
use a6hub_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::{CreateJob, Job};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, job_type, status_id, config, started_at, completed_at, \
    current_step, progress_data, logs, error_message, artifacts_path, \
    project_id, user_id, worker_id, created_at, updated_at";

/// [`COLUMNS`] without the log text, for listings.
const LIST_COLUMNS: &str = "\
    id, job_type, status_id, config, started_at, completed_at, \
    current_step, progress_data, NULL::TEXT AS logs, error_message, artifacts_path, \
    project_id, user_id, worker_id, created_at, updated_at";

fn insert_query() -> String {
    format!(
        "INSERT INTO jobs (job_type, status_id, config, project_id, user_id) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING {COLUMNS}"
    )
}

fn active_ids() -> Vec<StatusId> {
    ACTIVE_STATUSES.iter().map(|s| s.id()).collect()
}

pub struct JobRepo;

impl JobRepo {
    /// Insert a new PENDING job.
    pub async fn create(pool: &PgPool, input: &CreateJob) -> Result<Job, sqlx::Error> {
        sqlx::query_as::<_, Job>(&insert_query())
            .bind(input.job_type.as_str())
            .bind(JobStatus::Pending.id())
            .bind(&input.config)
            .bind(input.project_id)
            .bind(input.user_id)
            .fetch_one(pool)
            .await
    }

    /// Insert a new PENDING job together with its `job_queue` entry.
    ///
    /// Both rows are written in one transaction, so a job is never left
    /// PENDING without a way to be claimed.
    pub async fn create_enqueued(pool: &PgPool, input: &CreateJob) -> Result<Job, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&insert_query())
            .bind(input.job_type.as_str())
            .bind(JobStatus::Pending.id())
            .bind(&input.config)
            .bind(input.project_id)
            .bind(input.user_id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO job_queue (job_id, queue) VALUES ($1, $2)")
            .bind(job.id)
            .bind(input.job_type.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// A project's jobs, newest first, without their logs.
    pub async fn list_by_project(pool: &PgPool, project_id: DbId) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {LIST_COLUMNS} FROM jobs WHERE project_id = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(project_id)
            .fetch_all(pool)
            .await
    }

    /// Most recently created job of `job_type` in a project.
    pub async fn latest_by_type(
        pool: &PgPool,
        project_id: DbId,
        job_type: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE project_id = $1 AND job_type = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(project_id)
            .bind(job_type)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Current status id only; used by the driver's cancellation poll.
    pub async fn status_id(pool: &PgPool, id: DbId) -> Result<Option<StatusId>, sqlx::Error> {
        sqlx::query_scalar("SELECT status_id FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Move PENDING or RUNNING to RUNNING and record the owning worker.
    ///
    /// Returns `None` when the job is terminal (or missing). `started_at`
    /// keeps its first value across redeliveries.
    pub async fn mark_running(
        pool: &PgPool,
        id: DbId,
        worker_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, worker_id = $3, \
                 started_at = COALESCE(started_at, NOW()), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .bind(JobStatus::Running.id())
            .bind(worker_id)
            .bind(active_ids())
            .fetch_optional(pool)
            .await
    }

    /// Append a chunk to `logs`. Never overwrites.
    pub async fn append_logs(pool: &PgPool, id: DbId, chunk: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE jobs SET logs = COALESCE(logs, '') || $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(chunk)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Upsert `current_step` and `progress_data` for a RUNNING job.
    ///
    /// A write that would lower the stored percentage is dropped.
    pub async fn update_progress(
        pool: &PgPool,
        id: DbId,
        data: &ProgressData,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET current_step = $2, progress_data = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id = $4 \
               AND COALESCE((progress_data->>'progress_percent')::INTEGER, 0) <= $5",
        )
        .bind(id)
        .bind(data.current_step.as_deref())
        .bind(data.to_json())
        .bind(JobStatus::Running.id())
        .bind(i32::from(data.progress_percent))
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// RUNNING -> COMPLETED with the final progress snapshot.
    pub async fn complete(
        pool: &PgPool,
        id: DbId,
        artifacts_path: &str,
        data: &ProgressData,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, artifacts_path = $3, current_step = $4, \
                 progress_data = $5, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $6",
        )
        .bind(id)
        .bind(JobStatus::Completed.id())
        .bind(artifacts_path)
        .bind(data.current_step.as_deref())
        .bind(data.to_json())
        .bind(JobStatus::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// PENDING/RUNNING -> FAILED. No automatic retry follows.
    pub async fn fail(pool: &PgPool, id: DbId, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, error_message = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($4)",
        )
        .bind(id)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(active_ids())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// PENDING/RUNNING -> CANCELLED.
    ///
    /// Returns `false` if the job was already terminal; repeated cancels
    /// are no-ops.
    pub async fn cancel(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs \
             SET status_id = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(id)
        .bind(JobStatus::Cancelled.id())
        .bind(active_ids())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail every RUNNING job whose last write is older than `max_age_secs`.
    pub async fn fail_stale_running(
        pool: &PgPool,
        max_age_secs: f64,
        error: &str,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE jobs \
             SET status_id = $1, error_message = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE status_id = $3 AND updated_at < NOW() - make_interval(secs => $4) \
             RETURNING id",
        )
        .bind(JobStatus::Failed.id())
        .bind(error)
        .bind(JobStatus::Running.id())
        .bind(max_age_secs)
        .fetch_all(pool)
        .await
    }
}
