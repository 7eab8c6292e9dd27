//! Encrypted metadata store: one sealed JSON document mapping id → Item.
//!
//! The whole document is decrypted into memory once, at `init`. Every mutation
//! re-serializes and re-seals the entire mapping and replaces the backing file
//! atomically (write temp, fsync, rename). If the write does not land, the
//! in-memory mutation is undone, so memory and disk never disagree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use cloak_core::{CloakError, CloakResult, Item};
use cloak_crypto::{open_document, read_salt, seal_document, SecretKey, SALT_SIZE};

pub struct MetadataStore {
    /// Backing file on disk
    path: PathBuf,
    /// KDF salt, persisted in the envelope header
    salt: [u8; SALT_SIZE],
    /// HKDF sub-key sealing the document
    store_key: SecretKey,
    /// In-memory mirror of the document: id → Item
    items: BTreeMap<String, Item>,
}

impl MetadataStore {
    /// Read the KDF salt of an existing store, or `None` on first run.
    pub async fn stored_salt(path: &Path) -> CloakResult<Option<[u8; SALT_SIZE]>> {
        match tokio::fs::read(path).await {
            Ok(blob) => Ok(Some(read_salt(&blob)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CloakError::io(path, e)),
        }
    }

    /// Open the store at `path`, creating an empty one if it does not exist.
    ///
    /// A wrong key on an existing store fails with `Authentication`.
    pub async fn init(
        path: &Path,
        store_key: SecretKey,
        salt: [u8; SALT_SIZE],
    ) -> CloakResult<Self> {
        let mut store = MetadataStore {
            path: path.to_path_buf(),
            salt,
            store_key,
            items: BTreeMap::new(),
        };

        match tokio::fs::read(path).await {
            Ok(blob) => {
                if read_salt(&blob)? != salt {
                    return Err(CloakError::Store(format!(
                        "salt mismatch for {}",
                        path.display()
                    )));
                }
                let json = open_document(&store.store_key, &blob)?;
                store.items = serde_json::from_slice(&json)
                    .map_err(|e| CloakError::Store(format!("parsing metadata document: {e}")))?;
                debug!(path = %path.display(), items = store.items.len(), "loaded metadata store");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                store.persist().await?;
                debug!(path = %path.display(), "created empty metadata store");
            }
            Err(e) => return Err(CloakError::io(path, e)),
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Temp file used while a new document version is being written.
    pub fn pending_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn get_all(&self) -> &BTreeMap<String, Item> {
        &self.items
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Register `item` under a freshly minted id, ignoring any id it carries.
    pub async fn set(&mut self, mut item: Item) -> CloakResult<Item> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        item.meta_mut().id = id.clone();
        self.items.insert(id.clone(), item.clone());
        if let Err(e) = self.persist().await {
            self.items.remove(&id);
            return Err(e);
        }
        Ok(item)
    }

    /// Overwrite the record stored under `id`.
    pub async fn replace(&mut self, id: &str, mut item: Item) -> CloakResult<()> {
        if !self.items.contains_key(id) {
            return Err(CloakError::NotRegistered(id.to_string()));
        }
        item.meta_mut().id = id.to_string();
        let previous = self.items.insert(id.to_string(), item);
        if let Err(e) = self.persist().await {
            if let Some(previous) = previous {
                self.items.insert(id.to_string(), previous);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove and return the record stored under `id`.
    pub async fn delete(&mut self, id: &str) -> CloakResult<Item> {
        let removed = self
            .items
            .remove(id)
            .ok_or_else(|| CloakError::NotRegistered(id.to_string()))?;
        if let Err(e) = self.persist().await {
            self.items.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(removed)
    }

    /// Seal the whole document and atomically replace the backing file.
    async fn persist(&self) -> CloakResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CloakError::io(parent, e))?;
        }

        let json = serde_json::to_vec(&self.items)
            .map_err(|e| CloakError::Store(format!("serializing metadata document: {e}")))?;
        let blob = seal_document(&self.store_key, &self.salt, &json)?;

        let tmp_path = self.pending_path();
        let result = write_synced(&tmp_path, &blob).await;
        if let Err(e) = result {
            crate::fsutil::discard_file(&tmp_path).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| CloakError::io(&self.path, e))?;

        debug!(path = %self.path.display(), items = self.items.len(), bytes = blob.len(), "metadata store written");
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> CloakResult<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| CloakError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CloakError::io(path, e))?;
    file.sync_all().await.map_err(|e| CloakError::io(path, e))
}
