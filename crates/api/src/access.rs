//! Who may see or act on a job.

use a6hub_core::types::DbId;
use a6hub_db::models::job::Job;
use a6hub_db::models::project::Project;

/// Job owner, project owner, or anyone for a public project.
pub fn can_read(user_id: DbId, job: &Job, project: Option<&Project>) -> bool {
    job.user_id == user_id || project.is_some_and(|p| p.owner_id == user_id || p.is_public())
}

/// Project owner, or anyone for a public project.
pub fn can_read_project(user_id: DbId, project: &Project) -> bool {
    project.owner_id == user_id || project.is_public()
}

/// Job owner or project owner.
pub fn can_manage(user_id: DbId, job: &Job, project: Option<&Project>) -> bool {
    job.user_id == user_id || project.is_some_and(|p| p.owner_id == user_id)
}
