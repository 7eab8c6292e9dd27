//! Metadata records for encrypted artifacts.
//!
//! Serialized shape (camelCase, tagged by `type`):
//! ```text
//! { "type": "folder", "id": "...", "encryptedName": "...", "originalName": "docs",
//!   "path": "/home/me/docs", "size": 1024, "createdAt": 1760000000000,
//!   "isHidden": false, "content": [ { "type": "file", ... } ] }
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Open map of caller-supplied properties.
pub type ExtraProps = serde_json::Map<String, serde_json::Value>;

/// Fields shared by file and folder records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMeta {
    /// Opaque identifier minted by the metadata store on registration
    #[serde(default)]
    pub id: String,
    /// Name ciphertext, text-encoded
    pub encrypted_name: String,
    pub original_name: String,
    /// Absolute path of the item at encryption time
    pub path: String,
    /// Plaintext bytes (folders: sum over all contained files)
    pub size: u64,
    /// Unix milliseconds
    pub created_at: u64,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_props: Option<ExtraProps>,
}

impl ItemMeta {
    /// A fresh, unregistered record stamped with the current time.
    pub fn new(
        encrypted_name: String,
        original_name: String,
        path: String,
        size: u64,
    ) -> Self {
        Self {
            id: String::new(),
            encrypted_name,
            original_name,
            path,
            size,
            created_at: now_millis(),
            is_hidden: false,
            extra_props: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    #[serde(flatten)]
    pub meta: ItemMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderItem {
    #[serde(flatten)]
    pub meta: ItemMeta,
    /// Direct children: folders first, then files, each group ordered by name
    #[serde(default)]
    pub content: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Item {
    File(FileItem),
    Folder(FolderItem),
}

impl Item {
    pub fn meta(&self) -> &ItemMeta {
        match self {
            Item::File(f) => &f.meta,
            Item::Folder(f) => &f.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ItemMeta {
        match self {
            Item::File(f) => &mut f.meta,
            Item::Folder(f) => &mut f.meta,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Item::Folder(_))
    }

    /// Name of the artifact on disk, without any hidden marker:
    /// `<id>.enc` for files, `<id>` for folders.
    pub fn artifact_name(&self) -> String {
        match self {
            Item::File(f) => format!("{}.{}", f.meta.id, crate::ENCRYPTED_EXTENSION),
            Item::Folder(f) => f.meta.id.clone(),
        }
    }

    pub fn as_folder(&self) -> Option<&FolderItem> {
        match self {
            Item::Folder(f) => Some(f),
            Item::File(_) => None,
        }
    }
}

impl From<FileItem> for Item {
    fn from(item: FileItem) -> Self {
        Item::File(item)
    }
}

impl From<FolderItem> for Item {
    fn from(item: FolderItem) -> Self {
        Item::Folder(item)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, name: &str, size: u64) -> Item {
        let mut meta = ItemMeta::new(
            format!("sealed-{name}"),
            name.to_string(),
            format!("/data/{name}"),
            size,
        );
        meta.id = id.to_string();
        Item::File(FileItem { meta })
    }

    #[test]
    fn file_item_json_shape() {
        let item = file("a1", "notes.txt", 12);
        let json = serde_json::to_value(&item).unwrap();

        assert_eq!(json["type"], "file");
        assert_eq!(json["id"], "a1");
        assert_eq!(json["encryptedName"], "sealed-notes.txt");
        assert_eq!(json["originalName"], "notes.txt");
        assert_eq!(json["size"], 12);
        assert_eq!(json["isHidden"], false);
        assert!(json.get("extraProps").is_none());
        assert!(json.get("content").is_none());
    }

    #[test]
    fn folder_item_roundtrip_keeps_order() {
        let mut meta = ItemMeta::new("sealed".into(), "docs".into(), "/data/docs".into(), 30);
        meta.id = "f1".into();
        let mut sub = ItemMeta::new("s".into(), "a-sub".into(), "/data/docs/a-sub".into(), 10);
        sub.id = "f2".into();
        let folder = Item::Folder(FolderItem {
            meta,
            content: vec![
                Item::Folder(FolderItem {
                    meta: sub,
                    content: vec![file("c1", "inner.bin", 10)],
                }),
                file("c2", "a.txt", 10),
                file("c3", "b.txt", 10),
            ],
        });

        let json = serde_json::to_string(&folder).unwrap();
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(back, folder);

        let ids: Vec<&str> = back
            .as_folder()
            .unwrap()
            .content
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(ids, vec!["f2", "c2", "c3"]);
    }

    #[test]
    fn extra_props_roundtrip() {
        let mut item = file("x", "photo.jpg", 3);
        let mut props = ExtraProps::new();
        props.insert("album".into(), serde_json::json!("summer"));
        item.meta_mut().extra_props = Some(props);

        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"extraProps\":{\"album\":\"summer\"}"));
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn artifact_names() {
        assert_eq!(file("abc", "x", 0).artifact_name(), "abc.enc");
        let mut meta = ItemMeta::new("s".into(), "d".into(), "/d".into(), 0);
        meta.id = "def".into();
        let folder = Item::Folder(FolderItem {
            meta,
            content: vec![],
        });
        assert_eq!(folder.artifact_name(), "def");
    }
}
