use std::path::{Path, PathBuf};

use thiserror::Error;

pub type CloakResult<T> = Result<T, CloakError>;

#[derive(Debug, Error)]
pub enum CloakError {
    /// Wrong key, tampered ciphertext, or a malformed frame.
    #[error("authentication failed: wrong key or tampered ciphertext")]
    Authentication,

    #[error("already encrypted: {}", .0.display())]
    AlreadyEncrypted(PathBuf),

    #[error("not registered in the metadata store: {0}")]
    NotRegistered(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("commit failed for {}: {reason}", path.display())]
    Commit { path: PathBuf, reason: String },

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl CloakError {
    /// Attach the offending path to an I/O error.
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        CloakError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        ))
    }

    pub fn commit(path: &Path, reason: impl Into<String>) -> Self {
        CloakError::Commit {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Errors a folder batch counts as skipped instead of aborting on.
    pub fn is_contained(&self) -> bool {
        matches!(
            self,
            CloakError::AlreadyEncrypted(_) | CloakError::NotRegistered(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_classification() {
        assert!(CloakError::AlreadyEncrypted(PathBuf::from("a.enc")).is_contained());
        assert!(CloakError::NotRegistered("abc".into()).is_contained());
        assert!(!CloakError::Authentication.is_contained());
        assert!(!CloakError::commit(Path::new("/x"), "rename failed").is_contained());
    }

    #[test]
    fn io_error_carries_path() {
        let err = CloakError::io(
            Path::new("/data/report.pdf"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/data/report.pdf"), "{msg}");
        match err {
            CloakError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
