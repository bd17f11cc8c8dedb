pub mod builds;
pub mod jobs;
