//! Atomic file writes so readers never observe a half-written task, result or
//! cache file

use filebridge_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Hidden sibling of `path`; task and result listings skip dot files
fn staging_path(path: &Path) -> Result<(PathBuf, PathBuf)> {
    let parent = path.parent().ok_or_else(|| {
        Error::configuration(format!(
            "invalid file path '{}': no parent directory",
            path.display()
        ))
    })?;
    let staged = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    Ok((parent.to_path_buf(), staged))
}

async fn write_synced(staged: &Path, content: &[u8]) -> Result<()> {
    let mut file = fs::File::create(staged)
        .await
        .map_err(|e| Error::file_system(staged, "create staging file", e))?;
    file.write_all(content)
        .await
        .map_err(|e| Error::file_system(staged, "write staging file", e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::file_system(staged, "sync staging file", e))
}

/// Write `content` to a staging file next to `path`, then rename it into
/// place. Missing parent directories are created. On failure the staging
/// file is removed and `path` keeps its previous content.
pub async fn write_atomic_async(path: &Path, content: &[u8]) -> Result<()> {
    let (parent, staged) = staging_path(path)?;

    fs::create_dir_all(&parent)
        .await
        .map_err(|e| Error::file_system(&parent, "create parent directory", e))?;

    if let Err(e) = write_synced(&staged, content).await {
        let _ = fs::remove_file(&staged).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&staged, path).await {
        let _ = fs::remove_file(&staged).await;
        return Err(Error::file_system(path, "atomic rename", e));
    }

    Ok(())
}
