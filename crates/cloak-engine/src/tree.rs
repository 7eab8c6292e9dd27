//! Folder tree engine: recursive encrypt/decrypt of directory trees.
//!
//! Encrypt, per folder:
//!   1. list entries: folders first, then files, each group in byte order
//!   2. recurse into subfolders (bounded fan-out), then encrypt files
//!      (same bound; already-encrypted files are skipped and counted)
//!   3. seal the folder name, register a `FolderItem` whose `content` replays
//!      the order from step 1, rename the folder to its id
//!
//! The top-level call works on a staged copy under the scratch root and only
//! relocates the finished tree over the original once everything committed.
//! Decrypt is the mirror image, driven by the recorded `content` order.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use cloak_core::{CloakError, CloakResult, FolderItem, Item, ItemMeta};

use crate::engine::{utf8_name, EncryptedFolder, EngineInner, FolderDecryption, Progress, ProgressFn};
use crate::fsutil::{copy_dir_all, dir_size, discard_dir, occupied};

/// Ids registered during one top-level encrypt, dropped again if it fails.
///
/// Siblings of a failed subtask keep running detached; once the ledger is
/// aborted, any registration they attempt is refused so the caller can undo it.
#[derive(Default)]
pub(crate) struct Ledger {
    state: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    ids: Vec<String>,
    aborted: bool,
}

impl Ledger {
    /// Record a registration; `false` means the run was already aborted.
    pub(crate) fn record(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.aborted {
            return false;
        }
        state.ids.push(id.to_string());
        true
    }

    fn abort(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.aborted = true;
        std::mem::take(&mut state.ids)
    }
}

async fn rollback(inner: &EngineInner, ledger: &Ledger) {
    let ids = ledger.abort();
    if ids.is_empty() {
        return;
    }
    warn!(count = ids.len(), "rolling back folder registrations");
    for id in ids.iter().rev() {
        inner.forget(id).await;
    }
}

/// Directory entries in restore order.
#[derive(Debug, Default)]
struct Listing {
    folders: Vec<(String, PathBuf)>,
    files: Vec<(String, PathBuf)>,
}

async fn list_sorted(dir: &Path) -> CloakResult<Listing> {
    let mut listing = Listing::default();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CloakError::io(dir, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CloakError::io(dir, e))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| CloakError::io(&path, e))?;
        let name = entry.file_name().into_string().map_err(|raw| {
            CloakError::InvalidArgument(format!(
                "name is not valid UTF-8: {}",
                raw.to_string_lossy()
            ))
        })?;
        if file_type.is_dir() {
            listing.folders.push((name, path));
        } else if file_type.is_file() {
            listing.files.push((name, path));
        } else {
            warn!(path = %path.display(), "skipping entry that is neither file nor folder");
        }
    }
    listing.folders.sort_by(|a, b| a.0.cmp(&b.0));
    listing.files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(listing)
}

/// Run one spawned task per input with at most `min(limit, inputs)` in flight.
///
/// Results come back in input order. The first error ends the wait; tasks
/// still running are left to finish detached and their results are dropped.
async fn fan_out<T, R, F, Fut>(limit: usize, inputs: Vec<T>, mut make: F) -> CloakResult<Vec<R>>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = CloakResult<R>> + Send + 'static,
    R: Send + 'static,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let semaphore = Arc::new(Semaphore::new(limit.min(inputs.len()).max(1)));
    let handles: Vec<_> = inputs
        .into_iter()
        .map(|input| {
            let semaphore = semaphore.clone();
            let task = make(input);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CloakError::Worker("fan-out semaphore closed".into()))?;
                task.await
            })
        })
        .collect();

    try_join_all(handles.into_iter().map(|handle| async move {
        handle
            .await
            .map_err(|e| CloakError::Worker(format!("folder subtask failed: {e}")))?
    }))
    .await
}

/// Turn a contained error into one skipped entry.
fn contain(result: CloakResult<usize>, path: &Path) -> CloakResult<usize> {
    match result {
        Ok(skipped) => Ok(skipped),
        Err(e) if e.is_contained() => {
            warn!(path = %path.display(), "skipping: {e}");
            Ok(1)
        }
        Err(e) => Err(e),
    }
}

// ── Encrypt ──────────────────────────────────────────────────────────────────

pub(crate) async fn encrypt_folder(
    inner: Arc<EngineInner>,
    path: PathBuf,
    on_progress: Option<ProgressFn>,
) -> CloakResult<EncryptedFolder> {
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| CloakError::io(&path, e))?;
    if !meta.is_dir() {
        return Err(CloakError::InvalidArgument(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    let name = utf8_name(&path)?;
    if inner.store.lock().await.contains(&name) {
        return Err(CloakError::AlreadyEncrypted(path));
    }
    let parent = path
        .parent()
        .ok_or_else(|| CloakError::InvalidArgument("cannot encrypt the root directory".into()))?
        .to_path_buf();

    let progress = Progress::new(dir_size(&path).await?, on_progress);

    let stage_root = inner
        .config
        .scratch_root()
        .join(format!(".cloak-stage-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&stage_root)
        .await
        .map_err(|e| CloakError::io(&stage_root, e))?;
    let staged = stage_root.join(&name);
    if let Err(e) = copy_dir_all(&path, &staged).await {
        discard_dir(&stage_root).await;
        return Err(e);
    }
    debug!(src = %path.display(), staged = %staged.display(), "folder staged");

    let ledger = Arc::new(Ledger::default());
    let (item, skipped) =
        match encrypt_tree(inner.clone(), staged, path.clone(), ledger.clone(), progress).await {
            Ok(done) => done,
            Err(e) => {
                rollback(&inner, &ledger).await;
                discard_dir(&stage_root).await;
                return Err(e);
            }
        };

    // Two-step relocation (copy, then delete) so the scratch root may live on
    // another device.
    let encrypted = stage_root.join(&item.meta.id);
    let dest = parent.join(&item.meta.id);
    if occupied(&dest).await {
        rollback(&inner, &ledger).await;
        discard_dir(&stage_root).await;
        return Err(CloakError::commit(&dest, "destination already exists"));
    }
    if let Err(e) = copy_dir_all(&encrypted, &dest).await {
        discard_dir(&dest).await;
        rollback(&inner, &ledger).await;
        discard_dir(&stage_root).await;
        return Err(CloakError::commit(&path, format!("relocating encrypted tree: {e}")));
    }
    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
        discard_dir(&stage_root).await;
        return Err(CloakError::commit(
            &path,
            format!(
                "encrypted copy kept at {}, but removing the original failed: {e}",
                dest.display()
            ),
        ));
    }
    discard_dir(&stage_root).await;

    info!(
        id = %item.meta.id,
        path = %path.display(),
        bytes = item.meta.size,
        skipped,
        "folder encrypted"
    );
    Ok(EncryptedFolder {
        item,
        path: dest,
        skipped,
    })
}

/// Encrypt the staged folder `dir` in place and rename it to its id.
///
/// `logical` is where the folder lived before staging; it is what the
/// records store as `path`.
fn encrypt_tree(
    inner: Arc<EngineInner>,
    dir: PathBuf,
    logical: PathBuf,
    ledger: Arc<Ledger>,
    progress: Arc<Progress>,
) -> BoxFuture<'static, CloakResult<(FolderItem, usize)>> {
    async move {
        let listing = list_sorted(&dir).await?;
        let limit = inner.orchestrator.threads();

        let subfolders = fan_out(limit, listing.folders, |(name, path)| {
            encrypt_tree(
                inner.clone(),
                path,
                logical.join(name),
                ledger.clone(),
                progress.clone(),
            )
        })
        .await?;

        let files = fan_out(limit, listing.files, |(name, path)| {
            let inner = inner.clone();
            let ledger = ledger.clone();
            let progress = progress.clone();
            let logical = logical.join(name);
            async move {
                match inner
                    .encrypt_one(&path, &logical, None, &progress, Some(&ledger))
                    .await
                {
                    Ok(item) => Ok(Some(item)),
                    Err(e) if e.is_contained() => {
                        warn!(path = %logical.display(), "skipping: {e}");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await?;

        let mut content = Vec::with_capacity(subfolders.len() + files.len());
        let mut size = 0u64;
        let mut skipped = 0usize;
        for (folder, nested_skipped) in subfolders {
            size += folder.meta.size;
            skipped += nested_skipped;
            content.push(Item::Folder(folder));
        }
        for file in files {
            match file {
                Some(file) => {
                    size += file.meta.size;
                    content.push(Item::File(file));
                }
                None => skipped += 1,
            }
        }

        let name = utf8_name(&logical)?;
        let meta = ItemMeta::new(
            inner.seal_name(&name)?,
            name,
            logical.to_string_lossy().into_owned(),
            size,
        );
        let registered = inner
            .store
            .lock()
            .await
            .set(Item::Folder(FolderItem { meta, content }))
            .await?;
        let folder = match registered {
            Item::Folder(folder) => folder,
            other => {
                inner.forget(other.id()).await;
                return Err(CloakError::Store("store returned a file for a folder".into()));
            }
        };
        if !ledger.record(&folder.meta.id) {
            inner.forget(&folder.meta.id).await;
            return Err(CloakError::commit(&logical, "folder encryption was aborted"));
        }

        let renamed = dir.with_file_name(&folder.meta.id);
        tokio::fs::rename(&dir, &renamed)
            .await
            .map_err(|e| CloakError::commit(&dir, format!("renaming folder to its id: {e}")))?;

        debug!(id = %folder.meta.id, path = %logical.display(), entries = folder.content.len(), "folder registered");
        Ok((folder, skipped))
    }
    .boxed()
}

// ── Decrypt ──────────────────────────────────────────────────────────────────

pub(crate) async fn decrypt_folder(
    inner: Arc<EngineInner>,
    path: PathBuf,
    on_progress: Option<ProgressFn>,
) -> FolderDecryption {
    let (visible, revealed) = match inner.reveal_path(&path).await {
        Ok(revealed) => revealed,
        Err(error) => {
            error!(path = %path.display(), "folder decryption failed: {error}");
            return FolderDecryption::Untouched { path, error };
        }
    };

    match restore_folder(&inner, &visible, on_progress).await {
        Ok((item, restored, skipped)) => {
            info!(
                id = %item.meta.id,
                path = %restored.display(),
                skipped,
                "folder decrypted"
            );
            FolderDecryption::Restored {
                item,
                path: restored,
                skipped,
            }
        }
        Err(error) => {
            if revealed && occupied(&visible).await {
                inner.rehide(&visible).await;
            }
            error!(path = %path.display(), "folder decryption failed: {error}");
            FolderDecryption::Untouched { path, error }
        }
    }
}

async fn restore_folder(
    inner: &Arc<EngineInner>,
    dir: &Path,
    on_progress: Option<ProgressFn>,
) -> CloakResult<(FolderItem, PathBuf, usize)> {
    let meta = tokio::fs::metadata(dir)
        .await
        .map_err(|e| CloakError::io(dir, e))?;
    if !meta.is_dir() {
        return Err(CloakError::InvalidArgument(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    let id = utf8_name(dir)?;
    let folder = lookup_folder(inner, &id).await?;

    // Refuse before any child is touched; decrypt_tree checks again in case
    // the target appears while the children are being restored.
    let name = inner.open_name(&folder.meta.encrypted_name)?;
    let dest = dir.with_file_name(&name);
    if occupied(&dest).await {
        return Err(CloakError::commit(&dest, "restore target already exists"));
    }

    let progress = Progress::new(folder.meta.size, on_progress);
    let (restored, skipped) =
        decrypt_tree(inner.clone(), dir.to_path_buf(), folder.clone(), progress).await?;
    Ok((folder, restored, skipped))
}

async fn lookup_folder(inner: &EngineInner, id: &str) -> CloakResult<FolderItem> {
    match inner.store.lock().await.get(id) {
        Some(Item::Folder(folder)) => Ok(folder.clone()),
        Some(Item::File(_)) => Err(CloakError::InvalidArgument(format!(
            "{id} is a file, not a folder"
        ))),
        None => Err(CloakError::NotRegistered(id.to_string())),
    }
}

/// Restore the encrypted folder `dir` (named by its id) and its contents,
/// replaying the recorded order: subfolders first, then files.
fn decrypt_tree(
    inner: Arc<EngineInner>,
    dir: PathBuf,
    folder: FolderItem,
    progress: Arc<Progress>,
) -> BoxFuture<'static, CloakResult<(PathBuf, usize)>> {
    async move {
        let limit = inner.orchestrator.threads();
        let (subfolders, files): (Vec<Item>, Vec<Item>) =
            folder.content.iter().cloned().partition(Item::is_folder);

        let nested = fan_out(limit, subfolders, |child| {
            let inner = inner.clone();
            let progress = progress.clone();
            let path = dir.join(child.artifact_name());
            async move {
                let result = match lookup_folder(&inner, child.id()).await {
                    Ok(stored) => decrypt_tree(inner.clone(), path.clone(), stored, progress)
                        .await
                        .map(|(_, skipped)| skipped),
                    Err(e) => Err(e),
                };
                contain(result, &path)
            }
        })
        .await?;

        let files = fan_out(limit, files, |child| {
            let inner = inner.clone();
            let progress = progress.clone();
            let path = dir.join(child.artifact_name());
            async move { contain(inner.decrypt_one(&path, &progress).await.map(|_| 0), &path) }
        })
        .await?;

        let skipped: usize = nested.into_iter().chain(files).sum();

        let name = inner.open_name(&folder.meta.encrypted_name)?;
        let dest = dir.with_file_name(&name);
        if occupied(&dest).await {
            return Err(CloakError::commit(&dest, "restore target already exists"));
        }
        tokio::fs::rename(&dir, &dest)
            .await
            .map_err(|e| CloakError::commit(&dir, format!("restoring folder name: {e}")))?;
        if let Err(e) = inner.store.lock().await.delete(&folder.meta.id).await {
            warn!(id = %folder.meta.id, "restored folder but could not drop its store entry: {e}");
        }

        debug!(id = %folder.meta.id, path = %dest.display(), "folder restored");
        Ok((dest, skipped))
    }
    .boxed()
}
