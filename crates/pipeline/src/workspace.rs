//! Per-job scratch directory `<root>/job_<id>`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use a6hub_core::hdl_files::is_safe_relative_path;
use a6hub_core::types::DbId;
use walkdir::WalkDir;

#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    /// Create a clean workspace for `job_id`, wiping leftovers of an
    /// earlier attempt.
    pub async fn acquire(root: &Path, job_id: DbId) -> io::Result<Self> {
        let dir = root.join(format!("job_{job_id}"));
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a path relative to the workspace.
    pub async fn write_file(&self, relative: &str, bytes: &[u8]) -> io::Result<()> {
        if !is_safe_relative_path(relative) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsafe path '{relative}'"),
            ));
        }
        let target = self.dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await
    }

    /// Regular files under the workspace not listed in `inputs`, as sorted
    /// `/`-separated relative paths. The walk runs on the blocking pool.
    pub async fn outputs(&self, inputs: &HashSet<String>) -> io::Result<Vec<String>> {
        let dir = self.dir.clone();
        let inputs = inputs.clone();
        tokio::task::spawn_blocking(move || list_outputs(&dir, &inputs))
            .await
            .map_err(io::Error::other)
    }
}

fn list_outputs(dir: &Path, inputs: &HashSet<String>) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(dir).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            (!inputs.contains(&rel)).then_some(rel)
        })
        .collect();
    files.sort();
    files
}
