//! Job update bus and the worker-side publisher.
//!
//! - [`UpdateBus`]: publish/subscribe seam keyed by job id.
//! - [`PgNotifyBus`]: cross-process bus over Postgres `LISTEN`/`NOTIFY`.
//! - [`LocalBus`]: in-process bus backed by `tokio::sync::broadcast`.
//! - [`ProgressPublisher`]: best-effort typed publishing for the driver.
//! - [`payload`]: the encoded size bound every update is cut to.

pub mod bus;
pub mod payload;
pub mod pg_notify;
pub mod publisher;

pub use bus::{channel_name, BusError, LocalBus, UpdateBus, UpdateStream};
pub use payload::{shrink_to_fit, MAX_PAYLOAD_BYTES, NOTIFY_PAYLOAD_LIMIT};
pub use pg_notify::PgNotifyBus;
pub use publisher::ProgressPublisher;
