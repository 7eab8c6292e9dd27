//! Filesystem helpers shared by the file and folder paths.

use std::path::{Path, PathBuf};

use cloak_core::{CloakError, CloakResult};
use tracing::{debug, warn};

/// A fresh temp path next to `path` (same directory, so the final rename
/// never crosses a device boundary).
pub fn temp_sibling(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".cloak-{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Recursively copy `src` into a new directory at `dst`.
///
/// Only directories and regular files are copied; anything else is skipped.
pub async fn copy_dir_all(src: &Path, dst: &Path) -> CloakResult<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir(&to)
            .await
            .map_err(|e| CloakError::io(&to, e))?;
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(|e| CloakError::io(&from, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CloakError::io(&from, e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CloakError::io(&path, e))?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((path, target));
            } else if file_type.is_file() {
                tokio::fs::copy(&path, &target)
                    .await
                    .map_err(|e| CloakError::io(&path, e))?;
            } else {
                warn!(path = %path.display(), "skipping non-regular entry while copying");
            }
        }
    }
    Ok(())
}

/// Total size of the regular files under `root`.
pub async fn dir_size(root: &Path) -> CloakResult<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CloakError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CloakError::io(&dir, e))?
        {
            let meta = tokio::fs::symlink_metadata(entry.path())
                .await
                .map_err(|e| CloakError::io(&entry.path(), e))?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Best-effort removal of a file; a missing file is not an error.
pub async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), "could not remove file: {e}"),
    }
}

/// Best-effort recursive removal of a directory.
pub async fn discard_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "could not remove directory: {e}"),
    }
}

/// `true` if something (file, dir or dangling link) occupies `path`.
pub async fn occupied(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
