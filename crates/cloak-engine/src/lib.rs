//! cloak-engine: at-rest encryption of files and directory trees
//!
//! Layers, leaves first:
//!   - `stream`: chunked encrypt/decrypt of one file into a temp path
//!   - `pool`: rayon worker pool running one stream transform per task
//!   - `store`: encrypted metadata document (id → Item)
//!   - `tree`: recursive, bounded fan-out folder encrypt/decrypt
//!   - `engine`: the `Engine` handle owning key, store, pool and config

pub mod engine;
pub mod fsutil;
pub mod hidden;
pub mod pool;
pub mod store;
pub mod stream;
mod tree;

pub use engine::{DecryptedFile, EncryptedFolder, Engine, FolderDecryption, ProgressFn};
pub use hidden::{DotPrefix, HiddenAttribute};
pub use pool::{TaskOrchestrator, TransformTask};
pub use store::MetadataStore;
pub use stream::TransformMode;
