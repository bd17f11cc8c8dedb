//! Live job subscriptions over WebSocket.
//!
//! [`JobFanout`] relays bus updates to every connection watching a job;
//! the upgrade handler authorizes the subscriber and sends the snapshot.

pub mod fanout;
mod handler;
mod heartbeat;

pub use fanout::JobFanout;
pub use handler::{authorize, job_updates_ws, Rejection};
pub use heartbeat::start_heartbeat;
