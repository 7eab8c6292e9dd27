//! Engine handle: owns the secret key, metadata store, worker pool and config,
//! and exposes the file, folder and visibility operations.
//!
//! File flow (encrypt):
//!   1. stream `src` → `.cloak-<uuid>.tmp` next to it on a pool worker
//!   2. seal the original name, register the item (store mints the id)
//!   3. rename temp → `<id>.enc`, remove the original
//!
//! Any failure after step 1 removes the temp/artifact and, once registered,
//! the store entry, so the caller sees either a committed item or the original
//! file untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cloak_core::config::{expand_home, EngineConfig};
use cloak_core::types::ExtraProps;
use cloak_core::{CloakError, CloakResult, FileItem, FolderItem, Item, ItemMeta, ENCRYPTED_EXTENSION};
use cloak_crypto::{
    decrypt_name, derive_name_key, derive_secret_key, derive_store_key, encrypt_name,
    generate_salt, KdfParams, SecretKey,
};

use crate::fsutil::{discard_file, occupied, temp_sibling};
use crate::hidden::{DotPrefix, HiddenAttribute};
use crate::pool::{TaskOrchestrator, TransformTask};
use crate::store::MetadataStore;
use crate::stream::TransformMode;
use crate::tree::{self, Ledger};

/// Progress callback (bytes_done, bytes_total)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of a committed folder encryption.
#[derive(Debug, Clone)]
pub struct EncryptedFolder {
    pub item: FolderItem,
    /// `<parent>/<id>`
    pub path: PathBuf,
    /// Entries left alone because they were already encrypted
    pub skipped: usize,
}

/// Result of a committed file decryption.
#[derive(Debug, Clone)]
pub struct DecryptedFile {
    pub item: FileItem,
    /// Restored plaintext path
    pub path: PathBuf,
}

/// Outcome of `decrypt_folder`. A fatal error never surfaces as `Err`: the
/// caller gets back the still-encrypted path together with the cause.
#[derive(Debug)]
pub enum FolderDecryption {
    Restored {
        item: FolderItem,
        path: PathBuf,
        /// Entries missing from the store
        skipped: usize,
    },
    Untouched {
        path: PathBuf,
        error: CloakError,
    },
}

impl FolderDecryption {
    pub fn path(&self) -> &Path {
        match self {
            FolderDecryption::Restored { path, .. } | FolderDecryption::Untouched { path, .. } => {
                path
            }
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, FolderDecryption::Restored { .. })
    }
}

/// Cumulative progress shared by every task of one top-level call.
pub(crate) struct Progress {
    total: u64,
    done: AtomicU64,
    callback: Option<ProgressFn>,
}

impl Progress {
    pub(crate) fn new(total: u64, callback: Option<ProgressFn>) -> Arc<Self> {
        Arc::new(Self {
            total,
            done: AtomicU64::new(0),
            callback,
        })
    }

    pub(crate) fn advance(&self, n: u64) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(cb) = &self.callback {
            cb(done, self.total);
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) key: Arc<SecretKey>,
    pub(crate) name_key: SecretKey,
    pub(crate) store: Mutex<MetadataStore>,
    pub(crate) orchestrator: TaskOrchestrator,
    pub(crate) config: EngineConfig,
    pub(crate) hidden: Arc<dyn HiddenAttribute>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Derive the key from `passphrase`, open (or create) the metadata store
    /// and prepare the worker pool. Uses the dot-prefix hidden convention.
    pub async fn init(
        passphrase: &SecretString,
        config: EngineConfig,
        kdf: KdfParams,
    ) -> CloakResult<Self> {
        Self::with_hidden(passphrase, config, kdf, Box::new(DotPrefix)).await
    }

    /// Like [`Engine::init`] with a caller-supplied hidden-attribute capability.
    pub async fn with_hidden(
        passphrase: &SecretString,
        config: EngineConfig,
        kdf: KdfParams,
        hidden: Box<dyn HiddenAttribute>,
    ) -> CloakResult<Self> {
        config.validate()?;
        let store_path = expand_home(&config.store_path);

        let salt = match MetadataStore::stored_salt(&store_path).await? {
            Some(salt) => salt,
            None => generate_salt(),
        };
        let owned = SecretString::from(passphrase.expose_secret().to_owned());
        let key = tokio::task::spawn_blocking(move || derive_secret_key(&owned, &salt, &kdf))
            .await
            .map_err(|e| CloakError::Worker(format!("key derivation task failed: {e}")))??;

        let store = MetadataStore::init(&store_path, derive_store_key(&key)?, salt).await?;
        let name_key = derive_name_key(&key)?;
        let orchestrator = TaskOrchestrator::new(
            config.effective_threads(),
            config.chunk_size,
            config.chunk_log.as_deref().map(expand_home),
        );

        info!(
            store = %store_path.display(),
            items = store.len(),
            threads = orchestrator.threads(),
            "engine ready"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                key: Arc::new(key),
                name_key,
                store: Mutex::new(store),
                orchestrator,
                config,
                hidden: Arc::from(hidden),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.inner.orchestrator
    }

    /// Encrypt one file in place, replacing it with `<id>.enc`.
    pub async fn encrypt_file(
        &self,
        path: &Path,
        on_progress: Option<ProgressFn>,
    ) -> CloakResult<FileItem> {
        self.encrypt_file_inner(path, None, on_progress).await
    }

    /// Encrypt one file and attach caller-supplied properties to its record.
    /// Rejected unless `allow_extra_props` is enabled.
    pub async fn encrypt_file_with_props(
        &self,
        path: &Path,
        props: ExtraProps,
        on_progress: Option<ProgressFn>,
    ) -> CloakResult<FileItem> {
        if !self.inner.config.allow_extra_props {
            return Err(CloakError::InvalidArgument(
                "extra properties are disabled (engine.allow_extra_props = false)".into(),
            ));
        }
        self.encrypt_file_inner(path, Some(props), on_progress).await
    }

    async fn encrypt_file_inner(
        &self,
        path: &Path,
        props: Option<ExtraProps>,
        on_progress: Option<ProgressFn>,
    ) -> CloakResult<FileItem> {
        let path = absolute(path)?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CloakError::io(&path, e))?
            .len();
        let progress = Progress::new(size, on_progress);
        self.inner
            .encrypt_one(&path, &path, props, &progress, None)
            .await
    }

    /// Decrypt an `<id>.enc` artifact (hidden or not) back to its original name.
    pub async fn decrypt_file(
        &self,
        path: &Path,
        on_progress: Option<ProgressFn>,
    ) -> CloakResult<DecryptedFile> {
        let given = absolute(path)?;
        let (artifact, revealed) = self.inner.reveal_path(&given).await?;

        let total = match artifact_id(&artifact) {
            Ok(id) => self
                .inner
                .store
                .lock()
                .await
                .get(&id)
                .map(|item| item.meta().size)
                .unwrap_or_default(),
            Err(_) => 0,
        };
        let progress = Progress::new(total, on_progress);
        let result = self.inner.decrypt_one(&artifact, &progress).await;
        if result.is_err() && revealed {
            self.inner.rehide(&artifact).await;
        }
        result
    }

    /// Encrypt a directory tree, replacing it with `<parent>/<id>`.
    pub async fn encrypt_folder(
        &self,
        path: &Path,
        on_progress: Option<ProgressFn>,
    ) -> CloakResult<EncryptedFolder> {
        let path = absolute(path)?;
        tree::encrypt_folder(self.inner.clone(), path, on_progress).await
    }

    /// Restore an encrypted directory tree to its original name.
    pub async fn decrypt_folder(
        &self,
        path: &Path,
        on_progress: Option<ProgressFn>,
    ) -> FolderDecryption {
        match absolute(path) {
            Ok(path) => tree::decrypt_folder(self.inner.clone(), path, on_progress).await,
            Err(error) => FolderDecryption::Untouched {
                path: path.to_path_buf(),
                error,
            },
        }
    }

    /// Hide the artifact of item `id`. Returns `false` if it already was.
    pub async fn hide_item(&self, id: &str) -> CloakResult<bool> {
        self.set_visibility(id, true).await
    }

    /// Reveal the artifact of item `id`. Returns `false` if it was not hidden.
    pub async fn reveal_item(&self, id: &str) -> CloakResult<bool> {
        self.set_visibility(id, false).await
    }

    async fn set_visibility(&self, id: &str, hide: bool) -> CloakResult<bool> {
        let mut store = self.inner.store.lock().await;
        let mut item = store
            .get(id)
            .cloned()
            .ok_or_else(|| CloakError::NotRegistered(id.to_string()))?;
        if item.meta().is_hidden == hide {
            return Ok(false);
        }

        let visible = artifact_location(&item)?;
        let hidden = self.inner.hidden.hidden_path(&visible);
        let moved = if hide {
            self.inner.move_hidden(&visible, true).await?
        } else {
            self.inner.move_hidden(&hidden, false).await?
        };

        item.meta_mut().is_hidden = hide;
        if let Err(e) = store.replace(id, item).await {
            if let Err(undo_err) = self.inner.move_hidden(&moved, !hide).await {
                warn!(id, "could not undo visibility change: {undo_err}");
            }
            return Err(e);
        }

        info!(id, hidden = hide, path = %moved.display(), "visibility changed");
        Ok(true)
    }

    /// Snapshot of every registered item, keyed by id.
    pub async fn list_items(&self) -> BTreeMap<String, Item> {
        self.inner.store.lock().await.get_all().clone()
    }

    /// Release the worker pool. The engine stays usable; the next transform
    /// starts a new pool.
    pub fn shutdown(&self) {
        self.inner.orchestrator.shutdown();
    }
}

impl EngineInner {
    /// Encrypt the file at `path` in place.
    ///
    /// `logical` is the path recorded in the item (it differs from `path`
    /// when the file sits in a staged copy of its folder).
    pub(crate) async fn encrypt_one(
        &self,
        path: &Path,
        logical: &Path,
        props: Option<ExtraProps>,
        progress: &Arc<Progress>,
        ledger: Option<&Ledger>,
    ) -> CloakResult<FileItem> {
        if path.extension().and_then(|e| e.to_str()) == Some(ENCRYPTED_EXTENSION) {
            return Err(CloakError::AlreadyEncrypted(path.to_path_buf()));
        }
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| CloakError::io(path, e))?;
        if !meta.is_file() {
            return Err(CloakError::InvalidArgument(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let original_name = utf8_name(path)?;
        let encrypted_name = self.seal_name(&original_name)?;

        let temp = temp_sibling(path);
        let task = TransformTask {
            mode: TransformMode::Encrypt,
            src: path.to_path_buf(),
            temp: temp.clone(),
            key: self.key.clone(),
        };
        let progress_sink = progress.clone();
        let size = self
            .orchestrator
            .run(task, move |n| progress_sink.advance(n))
            .await?;

        let mut item_meta = ItemMeta::new(
            encrypted_name,
            original_name,
            logical.to_string_lossy().into_owned(),
            size,
        );
        item_meta.extra_props = props;
        let registered = self
            .store
            .lock()
            .await
            .set(Item::File(FileItem { meta: item_meta }))
            .await;
        let registered = match registered {
            Ok(Item::File(item)) => item,
            Ok(other) => {
                discard_file(&temp).await;
                self.forget(other.id()).await;
                return Err(CloakError::Store("store returned a folder for a file".into()));
            }
            Err(e) => {
                discard_file(&temp).await;
                return Err(e);
            }
        };
        if let Some(ledger) = ledger {
            if !ledger.record(&registered.meta.id) {
                discard_file(&temp).await;
                self.forget(&registered.meta.id).await;
                return Err(CloakError::commit(path, "folder encryption was aborted"));
            }
        }

        let artifact = path.with_file_name(format!("{}.{ENCRYPTED_EXTENSION}", registered.meta.id));
        if let Err(e) = tokio::fs::rename(&temp, &artifact).await {
            discard_file(&temp).await;
            self.forget(&registered.meta.id).await;
            return Err(CloakError::commit(path, format!("placing artifact: {e}")));
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            discard_file(&artifact).await;
            self.forget(&registered.meta.id).await;
            return Err(CloakError::commit(path, format!("removing original: {e}")));
        }

        info!(id = %registered.meta.id, path = %logical.display(), bytes = size, "file encrypted");
        Ok(registered)
    }

    /// Decrypt the visible artifact `<id>.enc` next to where it lies.
    pub(crate) async fn decrypt_one(
        &self,
        artifact: &Path,
        progress: &Arc<Progress>,
    ) -> CloakResult<DecryptedFile> {
        let id = artifact_id(artifact)?;
        let item = match self.store.lock().await.get(&id) {
            Some(Item::File(item)) => item.clone(),
            Some(Item::Folder(_)) => {
                return Err(CloakError::InvalidArgument(format!(
                    "{id} is a folder, not a file"
                )))
            }
            None => return Err(CloakError::NotRegistered(id)),
        };

        let name = self.open_name(&item.meta.encrypted_name)?;
        let dest = artifact.with_file_name(&name);
        if occupied(&dest).await {
            return Err(CloakError::commit(&dest, "restore target already exists"));
        }

        let temp = temp_sibling(artifact);
        let task = TransformTask {
            mode: TransformMode::Decrypt,
            src: artifact.to_path_buf(),
            temp: temp.clone(),
            key: self.key.clone(),
        };
        let progress_sink = progress.clone();
        self.orchestrator
            .run(task, move |n| progress_sink.advance(n))
            .await?;

        if occupied(&dest).await {
            discard_file(&temp).await;
            return Err(CloakError::commit(&dest, "restore target already exists"));
        }
        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            discard_file(&temp).await;
            return Err(CloakError::commit(&dest, format!("placing plaintext: {e}")));
        }
        if let Err(e) = tokio::fs::remove_file(artifact).await {
            discard_file(&dest).await;
            return Err(CloakError::commit(artifact, format!("removing artifact: {e}")));
        }
        if let Err(e) = self.store.lock().await.delete(&id).await {
            warn!(id = %id, "restored file but could not drop its store entry: {e}");
        }

        info!(id = %id, path = %dest.display(), "file decrypted");
        Ok(DecryptedFile { item, path: dest })
    }

    /// Best-effort removal of a store entry during rollback.
    pub(crate) async fn forget(&self, id: &str) {
        if let Err(e) = self.store.lock().await.delete(id).await {
            warn!(id, "rollback could not remove store entry: {e}");
        }
    }

    /// Make `path` visible if it is hidden; returns the visible path and
    /// whether it had to be revealed.
    ///
    /// A hidden path is only moved once its visible name is a registered
    /// artifact (`<id>.enc` or `<id>`); anything else is `NotRegistered`.
    pub(crate) async fn reveal_path(&self, path: &Path) -> CloakResult<(PathBuf, bool)> {
        if !self.hidden.is_hidden(path) {
            return Ok((path.to_path_buf(), false));
        }
        let visible = self.hidden.visible_path(path);
        let id = if visible.extension().and_then(|e| e.to_str()) == Some(ENCRYPTED_EXTENSION) {
            artifact_id(&visible)?
        } else {
            utf8_name(&visible)?
        };
        if !self.store.lock().await.contains(&id) {
            return Err(CloakError::NotRegistered(id));
        }

        debug!(path = %path.display(), "revealing hidden artifact before decryption");
        Ok((self.move_hidden(path, false).await?, true))
    }

    pub(crate) async fn rehide(&self, path: &Path) {
        if let Err(e) = self.move_hidden(path, true).await {
            warn!(path = %path.display(), "could not re-hide artifact: {e}");
        }
    }

    /// Hide (`hide = true`) or reveal `path` on the blocking pool.
    pub(crate) async fn move_hidden(&self, path: &Path, hide: bool) -> CloakResult<PathBuf> {
        let hidden = self.hidden.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if hide {
                hidden.set_hidden(&path)
            } else {
                hidden.clear_hidden(&path)
            }
        })
        .await
        .map_err(|e| CloakError::Worker(format!("hidden-attribute task failed: {e}")))?
    }

    pub(crate) fn seal_name(&self, name: &str) -> CloakResult<String> {
        encrypt_name(&self.name_key, name, self.config.name_encoding)
    }

    pub(crate) fn open_name(&self, encrypted: &str) -> CloakResult<String> {
        decrypt_name(&self.name_key, encrypted, self.config.name_encoding)
    }
}

/// Absolute form of `path` (relative paths resolve against the cwd).
fn absolute(path: &Path) -> CloakResult<PathBuf> {
    std::path::absolute(path).map_err(|e| CloakError::io(path, e))
}

pub(crate) fn utf8_name(path: &Path) -> CloakResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            CloakError::InvalidArgument(format!("name is not valid UTF-8: {}", path.display()))
        })
}

/// The id encoded in an `<id>.enc` file name.
fn artifact_id(artifact: &Path) -> CloakResult<String> {
    if artifact.extension().and_then(|e| e.to_str()) != Some(ENCRYPTED_EXTENSION) {
        return Err(CloakError::InvalidArgument(format!(
            "not an encrypted artifact: {}",
            artifact.display()
        )));
    }
    artifact
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            CloakError::InvalidArgument(format!("not an encrypted artifact: {}", artifact.display()))
        })
}

/// Visible on-disk location of a top-level item's artifact.
fn artifact_location(item: &Item) -> CloakResult<PathBuf> {
    let original = Path::new(&item.meta().path);
    let parent = original.parent().ok_or_else(|| {
        CloakError::InvalidArgument(format!("item {} has no parent directory", item.id()))
    })?;
    Ok(parent.join(item.artifact_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_id_requires_enc_extension() {
        assert_eq!(
            artifact_id(Path::new("/x/0123abcd.enc")).unwrap(),
            "0123abcd"
        );
        assert!(matches!(
            artifact_id(Path::new("/x/photo.jpg")),
            Err(CloakError::InvalidArgument(_))
        ));
    }

    #[test]
    fn artifact_location_follows_original_parent() {
        let mut meta = ItemMeta::new("e".into(), "a.txt".into(), "/home/me/docs/a.txt".into(), 1);
        meta.id = "abc".into();
        let item = Item::File(FileItem { meta });
        assert_eq!(
            artifact_location(&item).unwrap(),
            PathBuf::from("/home/me/docs/abc.enc")
        );
    }

    #[test]
    fn progress_accumulates() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::<(u64, u64)>::new()));
        let sink = seen.clone();
        let callback: ProgressFn =
            Arc::new(move |done: u64, total: u64| sink.lock().unwrap().push((done, total)));
        let progress = Progress::new(10, Some(callback));
        progress.advance(4);
        progress.advance(6);
        assert_eq!(*seen.lock().unwrap(), vec![(4, 10), (10, 10)]);
    }
}
