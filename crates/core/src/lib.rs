//! Pure domain logic for the a6hub build pipeline.
//!
//! No I/O happens here. The crate holds the job state machine, stage
//! tables and detector, build/simulation settings with their defaults and
//! the update event wire schema shared by the worker and the API.

pub mod build_settings;
pub mod error;
pub mod hdl_files;
pub mod job_events;
pub mod job_status;
pub mod job_type;
pub mod progress;
pub mod stages;
pub mod types;
