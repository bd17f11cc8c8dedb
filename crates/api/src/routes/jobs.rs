use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

/// Routes mounted at `/jobs`. All require authentication.
///
/// ```text
/// GET    /{id}            -> get_job
/// GET    /{id}/logs       -> get_job_logs
/// POST   /{id}/cancel     -> cancel_job
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/logs", get(jobs::get_job_logs))
        .route("/{id}/cancel", post(jobs::cancel_job))
}
