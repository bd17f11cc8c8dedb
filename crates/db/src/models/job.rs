//! Job entity and DTOs.

use a6hub_core::job_status::{JobStatus, StatusId};
use a6hub_core::job_type::JobType;
use a6hub_core::progress::ProgressData;
use a6hub_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub job_type: String,
    pub status_id: StatusId,
    pub config: serde_json::Value,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub current_step: Option<String>,
    pub progress_data: Option<serde_json::Value>,
    #[serde(skip_serializing)]
    pub logs: Option<String>,
    pub error_message: Option<String>,
    pub artifacts_path: Option<String>,
    pub project_id: DbId,
    pub user_id: DbId,
    pub worker_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Decoded status; `None` only if the lookup table and enum disagree.
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::from_id(self.status_id)
    }

    pub fn kind(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    pub fn progress(&self) -> ProgressData {
        ProgressData::from_json(self.progress_data.as_ref())
    }
}

/// DTO for inserting a new PENDING job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJob {
    pub job_type: JobType,
    pub config: serde_json::Value,
    pub project_id: DbId,
    pub user_id: DbId,
}
