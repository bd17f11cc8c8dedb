//! Seams to the outside world that the driver does not own: where project
//! sources come from and where finished artifacts go.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use a6hub_core::types::DbId;
use a6hub_db::models::project_file::ProjectFile;
use a6hub_db::repositories::ProjectFileRepo;
use a6hub_db::store::StoreResult;
use async_trait::async_trait;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

#[async_trait]
pub trait FileSource: Send + Sync {
    /// A project's files, without content.
    async fn list(&self, project_id: DbId) -> StoreResult<Vec<ProjectFile>>;

    /// Bytes of one file. `None` when it has no stored content.
    async fn fetch(&self, file: &ProjectFile) -> StoreResult<Option<Vec<u8>>>;
}

/// Reads sources from the `project_files` table.
pub struct DbFileSource {
    pool: PgPool,
}

impl DbFileSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileSource for DbFileSource {
    async fn list(&self, project_id: DbId) -> StoreResult<Vec<ProjectFile>> {
        Ok(ProjectFileRepo::list_by_project(&self.pool, project_id).await?)
    }

    async fn fetch(&self, file: &ProjectFile) -> StoreResult<Option<Vec<u8>>> {
        let content = ProjectFileRepo::content(&self.pool, file.id).await?;
        Ok(content.flatten().map(String::into_bytes))
    }
}

/// In-memory sources keyed by project, for tests and local runs.
#[derive(Default)]
pub struct MemoryFileSource {
    files: HashMap<DbId, Vec<(String, Option<String>)>>,
}

impl MemoryFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, project_id: DbId, path: &str, content: Option<&str>) -> Self {
        self.files
            .entry(project_id)
            .or_default()
            .push((path.to_string(), content.map(str::to_string)));
        self
    }
}

#[async_trait]
impl FileSource for MemoryFileSource {
    async fn list(&self, project_id: DbId) -> StoreResult<Vec<ProjectFile>> {
        let mut files: Vec<ProjectFile> = self
            .files
            .get(&project_id)
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(i, (path, _))| ProjectFile {
                id: i as DbId + 1,
                project_id,
                filepath: path.clone(),
                content: None,
            })
            .collect();
        files.sort_by(|a, b| a.filepath.cmp(&b.filepath));
        Ok(files)
    }

    async fn fetch(&self, file: &ProjectFile) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .files
            .get(&file.project_id)
            .and_then(|files| files.iter().find(|(path, _)| *path == file.filepath))
            .and_then(|(_, content)| content.clone())
            .map(String::into_bytes))
    }
}

// ---------------------------------------------------------------------------
// ArtifactUploader
// ---------------------------------------------------------------------------

/// Relative location of a job's artifacts, recorded as `artifacts_path`.
pub fn artifacts_path(job_id: DbId) -> String {
    format!("jobs/{job_id}/artifacts")
}

#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Store `files` (relative to `workspace`) under [`artifacts_path`].
    async fn upload(&self, job_id: DbId, workspace: &Path, files: &[String]) -> io::Result<()>;
}

/// Copies artifacts into a directory tree on local disk.
pub struct LocalArtifactUploader {
    root: PathBuf,
}

impl LocalArtifactUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactUploader for LocalArtifactUploader {
    async fn upload(&self, job_id: DbId, workspace: &Path, files: &[String]) -> io::Result<()> {
        let dest_root = self.root.join(artifacts_path(job_id));
        for rel in files {
            let dest = dest_root.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(workspace.join(rel), &dest).await?;
        }
        tracing::debug!(job_id, count = files.len(), dest = %dest_root.display(), "Artifacts copied");
        Ok(())
    }
}

/// Discards artifacts.
pub struct NoopUploader;

#[async_trait]
impl ArtifactUploader for NoopUploader {
    async fn upload(&self, _job_id: DbId, _workspace: &Path, _files: &[String]) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_lists_sorted_and_fetches_content() {
        let source = MemoryFileSource::new()
            .with_file(1, "tb.v", Some("module tb; endmodule"))
            .with_file(1, "README.md", None)
            .with_file(2, "other.v", Some(""));

        let files = source.list(1).await.unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.filepath.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "tb.v"]);

        assert_eq!(source.fetch(&files[0]).await.unwrap(), None);
        assert_eq!(
            source.fetch(&files[1]).await.unwrap().as_deref(),
            Some(&b"module tb; endmodule"[..])
        );
        assert!(source.list(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_uploader_mirrors_relative_paths() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(ws.path().join("runs/final")).await.unwrap();
        tokio::fs::write(ws.path().join("runs/final/top.gds"), b"gds").await.unwrap();

        LocalArtifactUploader::new(out.path())
            .upload(4, ws.path(), &["runs/final/top.gds".to_string()])
            .await
            .unwrap();

        let copied = out.path().join("jobs/4/artifacts/runs/final/top.gds");
        assert_eq!(std::fs::read(copied).unwrap(), b"gds");
    }
}
