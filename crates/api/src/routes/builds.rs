use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{builds, jobs};
use crate::state::AppState;

/// Routes mounted at `/projects`. Authenticated. Submissions are owner only;
/// reads follow project visibility.
///
/// ```text
/// POST   /{project_id}/builds        -> start_build
/// POST   /{project_id}/simulations   -> start_simulation
/// GET    /{project_id}/jobs          -> list_project_jobs
/// GET    /{project_id}/build/status  -> get_build_status
/// GET    /{project_id}/build/config  -> get_build_config
/// ```
pub fn project_router() -> Router<AppState> {
    Router::new()
        .route("/{project_id}/builds", post(builds::start_build))
        .route("/{project_id}/simulations", post(builds::start_simulation))
        .route("/{project_id}/jobs", get(jobs::list_project_jobs))
        .route("/{project_id}/build/status", get(builds::get_build_status))
        .route("/{project_id}/build/config", get(builds::get_build_config))
}

/// Routes mounted at `/builds`. Public.
///
/// ```text
/// GET    /presets   -> list_presets
/// GET    /pdks      -> list_pdks
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/presets", get(builds::list_presets))
        .route("/pdks", get(builds::list_pdks))
}
