pub mod builds;
pub mod health;
pub mod jobs;
pub mod ws;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /projects/{project_id}/builds       start build (POST)
/// /projects/{project_id}/simulations  start simulation (POST)
/// /projects/{project_id}/jobs         project jobs, newest first
/// /projects/{project_id}/build/status latest build
/// /projects/{project_id}/build/config last-used or default build settings
///
/// /builds/presets                     flow presets
/// /builds/pdks                        supported PDKs
///
/// /jobs/{id}                          get job
/// /jobs/{id}/logs                     job logs
/// /jobs/{id}/cancel                   cancel (POST)
///
/// /ws/jobs/{job_id}?token=            live job updates (WebSocket)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/projects", builds::project_router())
        .nest("/builds", builds::router())
        .nest("/jobs", jobs::router())
        .nest("/ws", ws::router())
}
