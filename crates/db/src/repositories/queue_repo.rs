//! Repository for the `job_queue` table.
//!
//! A row is claimed with `FOR UPDATE SKIP LOCKED`, so concurrent workers
//! never receive the same entry. The owning worker deletes the row once
//! it has driven the job.

use a6hub_core::job_status::{JobStatus, TERMINAL_STATUSES};
use a6hub_core::types::DbId;
use sqlx::PgPool;

use crate::models::queue::QueueEntry;

const COLUMNS: &str = "id, job_id, queue, enqueued_at, claimed_by, claimed_at, attempts";

pub struct QueueRepo;

impl QueueRepo {
    /// Add a job to a queue. Returns `false` if it is already enqueued.
    pub async fn enqueue(pool: &PgPool, job_id: DbId, queue: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO job_queue (job_id, queue) VALUES ($1, $2) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(queue)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the oldest unclaimed entry on any of `queues`.
    pub async fn claim_next(
        pool: &PgPool,
        worker_id: &str,
        queues: &[String],
    ) -> Result<Option<QueueEntry>, sqlx::Error> {
        let query = format!(
            "UPDATE job_queue \
             SET claimed_by = $1, claimed_at = NOW(), attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM job_queue \
                 WHERE claimed_at IS NULL AND queue = ANY($2) \
                 ORDER BY enqueued_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntry>(&query)
            .bind(worker_id)
            .bind(queues)
            .fetch_optional(pool)
            .await
    }

    pub async fn remove(pool: &PgPool, job_id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM job_queue WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Return claims whose job never left PENDING to the queue.
    ///
    /// Only entries with fewer than `max_attempts` claims are released.
    pub async fn release_stale(
        pool: &PgPool,
        visibility_secs: f64,
        max_attempts: i32,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "UPDATE job_queue q \
             SET claimed_by = NULL, claimed_at = NULL \
             FROM jobs j \
             WHERE j.id = q.job_id AND j.status_id = $1 \
               AND q.claimed_at < NOW() - make_interval(secs => $2) \
               AND q.attempts < $3 \
             RETURNING q.job_id",
        )
        .bind(JobStatus::Pending.id())
        .bind(visibility_secs)
        .bind(max_attempts)
        .fetch_all(pool)
        .await
    }

    /// Delete stale claims that have used up their deliveries. The caller
    /// fails the returned jobs.
    pub async fn take_exhausted(
        pool: &PgPool,
        visibility_secs: f64,
        max_attempts: i32,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar(
            "DELETE FROM job_queue q \
             USING jobs j \
             WHERE j.id = q.job_id AND j.status_id = $1 \
               AND q.claimed_at < NOW() - make_interval(secs => $2) \
               AND q.attempts >= $3 \
             RETURNING q.job_id",
        )
        .bind(JobStatus::Pending.id())
        .bind(visibility_secs)
        .bind(max_attempts)
        .fetch_all(pool)
        .await
    }

    /// Drop entries whose job is already terminal.
    pub async fn purge_terminal(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let terminal: Vec<i16> = TERMINAL_STATUSES.iter().map(|s| s.id()).collect();
        let result = sqlx::query(
            "DELETE FROM job_queue q USING jobs j \
             WHERE j.id = q.job_id AND j.status_id = ANY($1)",
        )
        .bind(terminal)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
