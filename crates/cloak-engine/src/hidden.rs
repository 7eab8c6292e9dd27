//! Hidden-attribute capability for on-disk artifacts.
//!
//! The engine never toggles OS attributes itself; it asks a `HiddenAttribute`
//! implementation to move an artifact between its visible and hidden forms.
//! `DotPrefix` is the Unix convention: a hidden entry's name starts with `.`.
//!
//! Implementations are synchronous and may block on the filesystem; the
//! engine only calls the moving methods from tokio's blocking pool.

use std::path::{Path, PathBuf};

use cloak_core::{CloakError, CloakResult};

pub trait HiddenAttribute: Send + Sync {
    /// Where `path` lives once hidden.
    fn hidden_path(&self, path: &Path) -> PathBuf;

    /// Where a hidden `path` lives once revealed. Does not touch the disk.
    fn visible_path(&self, path: &Path) -> PathBuf;

    /// Hide `path`, returning its new location. Already-hidden paths are
    /// returned unchanged.
    fn set_hidden(&self, path: &Path) -> CloakResult<PathBuf>;

    /// Make `path` visible again, returning its new location.
    fn clear_hidden(&self, path: &Path) -> CloakResult<PathBuf>;

    fn is_hidden(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DotPrefix;

impl DotPrefix {
    fn file_name(path: &Path) -> CloakResult<&str> {
        path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                CloakError::InvalidArgument(format!("no usable file name: {}", path.display()))
            })
    }

    fn move_to(from: &Path, to: PathBuf) -> CloakResult<PathBuf> {
        if to.exists() {
            return Err(CloakError::commit(&to, "destination already exists"));
        }
        std::fs::rename(from, &to).map_err(|e| CloakError::io(from, e))?;
        Ok(to)
    }
}

impl HiddenAttribute for DotPrefix {
    fn hidden_path(&self, path: &Path) -> PathBuf {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.starts_with('.') => path.with_file_name(format!(".{name}")),
            _ => path.to_path_buf(),
        }
    }

    fn visible_path(&self, path: &Path) -> PathBuf {
        match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if self.is_hidden(path) => path.with_file_name(&name[1..]),
            _ => path.to_path_buf(),
        }
    }

    fn set_hidden(&self, path: &Path) -> CloakResult<PathBuf> {
        if self.is_hidden(path) {
            return Ok(path.to_path_buf());
        }
        Self::move_to(path, self.hidden_path(path))
    }

    fn clear_hidden(&self, path: &Path) -> CloakResult<PathBuf> {
        Self::file_name(path)?;
        if !self.is_hidden(path) {
            return Ok(path.to_path_buf());
        }
        Self::move_to(path, self.visible_path(path))
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.') && n.len() > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn hide_and_reveal_file() {
        let tmp = TempDir::new().unwrap();
        let visible = tmp.path().join("abc.enc");
        std::fs::write(&visible, b"x").unwrap();

        let hidden = DotPrefix.set_hidden(&visible).unwrap();
        assert_eq!(hidden, tmp.path().join(".abc.enc"));
        assert!(DotPrefix.is_hidden(&hidden));
        assert!(!visible.exists());

        let back = DotPrefix.clear_hidden(&hidden).unwrap();
        assert_eq!(back, visible);
        assert!(visible.exists());
        assert!(!DotPrefix.is_hidden(&back));
    }

    #[test]
    fn hide_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let hidden = tmp.path().join(".already");
        std::fs::create_dir(&hidden).unwrap();
        assert_eq!(DotPrefix.set_hidden(&hidden).unwrap(), hidden);
        assert!(hidden.is_dir());
    }

    #[test]
    fn hide_refuses_to_clobber() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"1").unwrap();
        std::fs::write(tmp.path().join(".a"), b"2").unwrap();

        let err = DotPrefix.set_hidden(&tmp.path().join("a")).unwrap_err();
        assert!(matches!(err, CloakError::Commit { .. }));
        assert_eq!(std::fs::read(tmp.path().join(".a")).unwrap(), b"2");
    }

    #[test]
    fn dot_alone_is_not_hidden() {
        assert!(!DotPrefix.is_hidden(Path::new("/x/.")));
        assert_eq!(
            DotPrefix.hidden_path(Path::new("/x/id.enc")),
            PathBuf::from("/x/.id.enc")
        );
    }

    #[test]
    fn visible_path_is_pure() {
        let tmp = TempDir::new().unwrap();
        let hidden = tmp.path().join(".abc.enc");
        std::fs::write(&hidden, b"x").unwrap();

        assert_eq!(DotPrefix.visible_path(&hidden), tmp.path().join("abc.enc"));
        assert!(hidden.exists());
        assert_eq!(DotPrefix.visible_path(Path::new("/x/id.enc")), PathBuf::from("/x/id.enc"));
        assert_eq!(DotPrefix.visible_path(Path::new("/x/.")), PathBuf::from("/x/."));
    }
}
