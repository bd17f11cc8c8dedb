//! Project source file entity (read-only here).

use a6hub_core::types::DbId;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `project_files` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProjectFile {
    pub id: DbId,
    pub project_id: DbId,
    /// Path relative to the project root.
    pub filepath: String,
    #[serde(skip_serializing)]
    pub content: Option<String>,
}
