//! Build job execution.
//!
//! [`BuildDriver`] takes one claimed job from RUNNING to a terminal state:
//! it prepares a scratch workspace, renders tool configuration, runs the
//! tool plan as child processes and streams their output through the stage
//! tracker, the [`PersistenceSink`] and the progress publisher.

pub mod collaborators;
pub mod config;
pub mod driver;
pub mod error;
pub mod plan;
pub mod runner;
pub mod sink;
pub mod workspace;

pub use collaborators::{
    ArtifactUploader, DbFileSource, FileSource, LocalArtifactUploader, MemoryFileSource,
    NoopUploader,
};
pub use config::{DriverConfig, ToolPaths};
pub use driver::{BuildDriver, DriveOutcome};
pub use error::BuildError;
pub use sink::PersistenceSink;
