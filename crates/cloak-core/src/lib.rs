//! cloak-core: shared types, config schema, and error types for the cloak engine

pub mod config;
pub mod error;
pub mod types;

pub use error::{CloakError, CloakResult};
pub use types::{FileItem, FolderItem, Item, ItemMeta};

/// Extension carried by every encrypted file artifact (`<id>.enc`).
pub const ENCRYPTED_EXTENSION: &str = "enc";
