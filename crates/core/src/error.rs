//! Domain error shared by every crate in the workspace.

use crate::job_status::JobStatus;
use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    /// A status change that the job state machine does not allow.
    #[error("Illegal job transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
