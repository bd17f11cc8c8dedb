//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod job_repo;
pub mod project_file_repo;
pub mod project_repo;
pub mod queue_repo;

pub use job_repo::JobRepo;
pub use project_file_repo::ProjectFileRepo;
pub use project_repo::ProjectRepo;
pub use queue_repo::QueueRepo;
