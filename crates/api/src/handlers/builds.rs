//! Job submission, per-project build views and the build catalogue.

use std::collections::BTreeMap;

use a6hub_core::build_settings::{
    flow_presets, BuildSettings, FlowPreset, SimulationSettings, SUPPORTED_PDKS,
};
use a6hub_core::error::CoreError;
use a6hub_core::hdl_files::resolve_sources;
use a6hub_core::job_status::JobStatus;
use a6hub_core::job_type::JobType;
use a6hub_core::types::DbId;
use a6hub_db::models::job::CreateJob;
use a6hub_db::models::project::Project;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::access;
use crate::error::{AppError, AppResult};
use crate::handlers::jobs::JobResponse;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of a submission. Missing options take their defaults.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub config: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// POST /api/v1/projects/{project_id}/builds
pub async fn start_build(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
    Json(input): Json<SubmitRequest>,
) -> AppResult<impl IntoResponse> {
    authorize_submit(&state, project_id, &auth).await?;
    let settings = BuildSettings::from_config(&input.config)?;
    submit(&state, &auth, project_id, JobType::Build, encode(&settings)?).await
}

/// POST /api/v1/projects/{project_id}/simulations
pub async fn start_simulation(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
    Json(input): Json<SubmitRequest>,
) -> AppResult<impl IntoResponse> {
    authorize_submit(&state, project_id, &auth).await?;
    let settings = SimulationSettings::from_config(&input.config)?;
    submit(&state, &auth, project_id, JobType::Simulation, encode(&settings)?).await
}

async fn find_project(state: &AppState, project_id: DbId) -> AppResult<Project> {
    state
        .store
        .find_project(project_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Project",
            id: project_id,
        }))
}

/// Fetch a project the caller may read.
pub(crate) async fn find_readable_project(
    state: &AppState,
    project_id: DbId,
    auth: &AuthUser,
) -> AppResult<Project> {
    let project = find_project(state, project_id).await?;
    if !access::can_read_project(auth.user_id, &project) {
        return Err(AppError::Core(CoreError::Forbidden("Access denied".into())));
    }
    Ok(project)
}

/// Only the project owner may start jobs.
async fn authorize_submit(state: &AppState, project_id: DbId, auth: &AuthUser) -> AppResult<()> {
    let project = find_project(state, project_id).await?;
    if project.owner_id != auth.user_id {
        return Err(AppError::Core(CoreError::Forbidden(
            "Only the project owner can start jobs".into(),
        )));
    }
    Ok(())
}

/// Stored with defaults filled in, so the job row shows what actually ran.
fn encode<T: Serialize>(settings: &T) -> AppResult<serde_json::Value> {
    serde_json::to_value(settings).map_err(|e| AppError::InternalError(e.to_string()))
}

/// Create the PENDING job together with exactly one entry on its queue.
async fn submit(
    state: &AppState,
    auth: &AuthUser,
    project_id: DbId,
    job_type: JobType,
    config: serde_json::Value,
) -> AppResult<impl IntoResponse> {
    let job = state
        .queue
        .submit(&CreateJob {
            job_type,
            config,
            project_id,
            user_id: auth.user_id,
        })
        .await?;

    tracing::info!(
        job_id = job.id,
        %job_type,
        project_id,
        user_id = auth.user_id,
        "Job submitted",
    );

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: JobResponse::from(job),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Project build views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct BuildStatusResponse {
    pub job_id: DbId,
    pub status: Option<JobStatus>,
    pub current_step: Option<String>,
    pub progress_data: Option<serde_json::Value>,
    pub logs: Option<String>,
}

/// GET /api/v1/projects/{project_id}/build/status
///
/// State of the project's most recent build job.
pub async fn get_build_status(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    find_readable_project(&state, project_id, &auth).await?;
    let job = state
        .store
        .latest_job(project_id, JobType::Build)
        .await?
        .ok_or_else(|| {
            AppError::Core(CoreError::NotFound {
                entity: "Build job for project",
                id: project_id,
            })
        })?;

    Ok(Json(DataResponse {
        data: BuildStatusResponse {
            job_id: job.id,
            status: job.status(),
            current_step: job.current_step,
            progress_data: job.progress_data,
            logs: job.logs,
        },
    }))
}

/// GET /api/v1/projects/{project_id}/build/config
///
/// The settings of the latest build, or defaults for a project that has
/// never been built: the project name as top module and every HDL source
/// the project holds.
pub async fn get_build_config(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let project = find_readable_project(&state, project_id, &auth).await?;

    if let Some(job) = state.store.latest_job(project_id, JobType::Build).await? {
        match BuildSettings::from_config(&job.config) {
            Ok(settings) => return Ok(Json(DataResponse { data: settings })),
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Stored build config no longer parses, using defaults");
            }
        }
    }

    let paths = state.store.project_file_paths(project_id).await?;
    let mut settings = BuildSettings::for_design(project.name);
    settings.verilog_files = resolve_sources(&[], &paths);
    Ok(Json(DataResponse { data: settings }))
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

/// GET /api/v1/builds/presets
pub async fn list_presets() -> Json<DataResponse<BTreeMap<&'static str, FlowPreset>>> {
    Json(DataResponse {
        data: flow_presets(),
    })
}

/// GET /api/v1/builds/pdks
pub async fn list_pdks() -> Json<DataResponse<&'static [&'static str]>> {
    Json(DataResponse {
        data: SUPPORTED_PDKS,
    })
}
