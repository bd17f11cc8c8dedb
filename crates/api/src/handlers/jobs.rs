//! Handlers for the `/jobs` resource.
//!
//! Reads need read access to the job (see [`access::can_read`]); cancel
//! needs the job or project owner.

use a6hub_core::error::CoreError;
use a6hub_core::job_status::JobStatus;
use a6hub_core::types::DbId;
use a6hub_db::models::job::Job;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::access;
use crate::error::{AppError, AppResult};
use crate::handlers::builds::find_readable_project;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// A job row with its decoded status.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    pub status: Option<JobStatus>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let status = job.status();
        Self { job, status }
    }
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub job_id: DbId,
    pub logs: String,
    pub status: Option<JobStatus>,
    pub current_step: Option<String>,
    pub progress_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Need {
    Read,
    Manage,
}

/// Fetch a job and check the caller may act on it.
async fn find_and_authorize(
    state: &AppState,
    job_id: DbId,
    auth: &AuthUser,
    need: Need,
) -> AppResult<Job> {
    let job = state
        .store
        .find_job(job_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        }))?;
    let project = state.store.find_project(job.project_id).await?;

    let allowed = match need {
        Need::Read => access::can_read(auth.user_id, &job, project.as_ref()),
        Need::Manage => access::can_manage(auth.user_id, &job, project.as_ref()),
    };
    if !allowed {
        return Err(AppError::Core(CoreError::Forbidden(
            "Access denied".into(),
        )));
    }
    Ok(job)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_and_authorize(&state, job_id, &auth, Need::Read).await?;
    Ok(Json(DataResponse {
        data: JobResponse::from(job),
    }))
}

/// GET /api/v1/projects/{project_id}/jobs
///
/// Newest first. Logs are fetched per job through `/jobs/{id}/logs`.
pub async fn list_project_jobs(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    find_readable_project(&state, project_id, &auth).await?;
    let jobs = state.store.list_project_jobs(project_id).await?;
    Ok(Json(DataResponse {
        data: jobs.into_iter().map(JobResponse::from).collect::<Vec<_>>(),
    }))
}

/// GET /api/v1/jobs/{id}/logs
///
/// Logs are append-only, so two reads are always related by prefix.
pub async fn get_job_logs(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let job = find_and_authorize(&state, job_id, &auth, Need::Read).await?;
    let status = job.status();
    Ok(Json(DataResponse {
        data: JobLogsResponse {
            job_id: job.id,
            logs: job.logs.unwrap_or_default(),
            status,
            current_step: job.current_step,
            progress_data: job.progress_data,
        },
    }))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Always 200. `cancelled` is `false` when the job had already finished.
/// A running job is stopped by its worker on the next cancellation poll.
pub async fn cancel_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    find_and_authorize(&state, job_id, &auth, Need::Manage).await?;

    let cancelled = state.store.cancel(job_id).await?;
    if cancelled {
        tracing::info!(job_id, user_id = auth.user_id, "Job cancelled");
        state.publisher.status(job_id, JobStatus::Cancelled).await;
    } else {
        tracing::debug!(job_id, "Cancel on finished job ignored");
    }

    Ok(Json(DataResponse {
        data: CancelResponse { cancelled },
    }))
}
