//! Read access to the `project_files` table.

use a6hub_core::types::DbId;
use sqlx::PgPool;

use crate::models::project_file::ProjectFile;

pub struct ProjectFileRepo;

impl ProjectFileRepo {
    /// List a project's files without their content, ordered by path.
    pub async fn list_by_project(
        pool: &PgPool,
        project_id: DbId,
    ) -> Result<Vec<ProjectFile>, sqlx::Error> {
        sqlx::query_as::<_, ProjectFile>(
            "SELECT id, project_id, filepath, NULL::TEXT AS content \
             FROM project_files WHERE project_id = $1 ORDER BY filepath",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
    }

    /// Stored text content. Outer `None`: no such file; inner: no content.
    pub async fn content(pool: &PgPool, id: DbId) -> Result<Option<Option<String>>, sqlx::Error> {
        sqlx::query_scalar("SELECT content FROM project_files WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
