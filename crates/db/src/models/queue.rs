//! Job queue entry.

use a6hub_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `job_queue` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueEntry {
    pub id: DbId,
    pub job_id: DbId,
    pub queue: String,
    pub enqueued_at: Timestamp,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<Timestamp>,
    /// Number of times the entry has been claimed.
    pub attempts: i32,
}
