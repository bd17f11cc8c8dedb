//! Build worker.
//!
//! Exposes the dispatcher, reaper and configuration so integration tests
//! and the binary entrypoint can both access them.

pub mod config;
pub mod dispatcher;
pub mod reaper;
