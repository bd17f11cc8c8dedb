use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the job store is unreachable.
    pub status: &'static str,
    pub version: &'static str,
    pub db_healthy: bool,
    pub live: LiveCounts,
}

/// Live subscription load on this API instance.
#[derive(Serialize)]
pub struct LiveCounts {
    pub connections: usize,
    /// Jobs with a bus subscription held open for them.
    pub jobs: usize,
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = state.store.ping().await.is_ok();
    if !db_healthy {
        tracing::warn!("Health check: job store unreachable");
    }

    Json(HealthResponse {
        status: if db_healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        live: LiveCounts {
            connections: state.fanout.connection_count().await,
            jobs: state.fanout.job_count().await,
        },
    })
}

/// Mounted at the root, outside `/api/v1`.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
