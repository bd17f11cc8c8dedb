use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/ws`. The token travels in the query string since
/// browsers cannot set headers on a WebSocket upgrade.
pub fn router() -> Router<AppState> {
    Router::new().route("/jobs/{job_id}", get(ws::job_updates_ws))
}
