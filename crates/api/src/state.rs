use std::sync::Arc;

use a6hub_db::store::{JobQueue, JobStore};
use a6hub_events::ProgressPublisher;

use crate::config::ServerConfig;
use crate::ws::JobFanout;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub config: Arc<ServerConfig>,
    /// Publishes the status change when a job is cancelled from the API.
    pub publisher: ProgressPublisher,
    /// Live job subscriptions.
    pub fanout: Arc<JobFanout>,
}
