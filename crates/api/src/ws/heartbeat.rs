use std::sync::Arc;
use std::time::Duration;

use crate::ws::fanout::JobFanout;

/// Interval between heartbeat pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Spawn a background task that sends periodic Ping frames to every job
/// subscriber so idle sockets stay open through proxies.
pub fn start_heartbeat(fanout: Arc<JobFanout>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

        loop {
            interval.tick().await;
            let count = fanout.connection_count().await;
            tracing::debug!(count, "WebSocket heartbeat ping");
            fanout.ping_all().await;
        }
    })
}
