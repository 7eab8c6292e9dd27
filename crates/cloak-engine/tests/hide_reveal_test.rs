//! Hiding and revealing encrypted artifacts through the engine.

use cloak_core::config::EngineConfig;
use cloak_core::CloakError;
use cloak_crypto::KdfParams;
use cloak_engine::{DotPrefix, Engine, HiddenAttribute};
use secrecy::SecretString;
use tempfile::TempDir;

async fn open_engine(tmp: &TempDir) -> Engine {
    let config = EngineConfig {
        max_threads: 2,
        store_path: tmp.path().join("store.db"),
        scratch_dir: Some(tmp.path().join("scratch")),
        ..Default::default()
    };
    let kdf = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    Engine::init(&SecretString::from("hidden things"), config, kdf)
        .await
        .unwrap()
}

#[tokio::test]
async fn hide_then_reveal_restores_visible_path() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("plan.txt"), b"the plan").unwrap();

    let item = engine.encrypt_file(&data.join("plan.txt"), None).await.unwrap();
    let visible = data.join(format!("{}.enc", item.meta.id));
    let hidden = data.join(format!(".{}.enc", item.meta.id));

    assert!(engine.hide_item(&item.meta.id).await.unwrap());
    assert!(!visible.exists());
    assert!(hidden.exists());
    assert!(DotPrefix.is_hidden(&hidden));
    assert!(engine.list_items().await[&item.meta.id].meta().is_hidden);

    assert!(!engine.hide_item(&item.meta.id).await.unwrap(), "already hidden");

    assert!(engine.reveal_item(&item.meta.id).await.unwrap());
    assert!(visible.exists());
    assert!(!hidden.exists());
    assert!(!engine.list_items().await[&item.meta.id].meta().is_hidden);
    assert!(!engine.reveal_item(&item.meta.id).await.unwrap(), "already visible");
    engine.shutdown();
}

#[tokio::test]
async fn hidden_file_decrypts_directly() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("keys.txt"), b"spare keys under the mat").unwrap();

    let item = engine.encrypt_file(&data.join("keys.txt"), None).await.unwrap();
    engine.hide_item(&item.meta.id).await.unwrap();

    let hidden = data.join(format!(".{}.enc", item.meta.id));
    let restored = engine.decrypt_file(&hidden, None).await.unwrap();
    assert_eq!(restored.path, data.join("keys.txt"));
    assert_eq!(std::fs::read(&restored.path).unwrap(), b"spare keys under the mat");
    assert!(!hidden.exists());
    engine.shutdown();
}

#[tokio::test]
async fn hidden_folder_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let root = tmp.path().join("data/private");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("a.txt"), b"a").unwrap();

    let encrypted = engine.encrypt_folder(&root, None).await.unwrap();
    assert!(engine.hide_item(&encrypted.item.meta.id).await.unwrap());
    let hidden = tmp
        .path()
        .join(format!("data/.{}", encrypted.item.meta.id));
    assert!(hidden.is_dir());

    assert!(engine.decrypt_folder(&hidden, None).await.is_restored());
    assert_eq!(std::fs::read(root.join("a.txt")).unwrap(), b"a");
    engine.shutdown();
}

#[tokio::test]
async fn unrelated_dotfile_is_left_alone() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let data = tmp.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join(".bashrc"), b"export A=1").unwrap();
    std::fs::write(data.join("bashrc"), b"visible twin").unwrap();
    std::fs::create_dir(data.join(".config")).unwrap();

    let err = engine.decrypt_file(&data.join(".bashrc"), None).await.unwrap_err();
    assert!(matches!(err, CloakError::NotRegistered(_)));
    assert_eq!(std::fs::read(data.join(".bashrc")).unwrap(), b"export A=1");
    assert_eq!(std::fs::read(data.join("bashrc")).unwrap(), b"visible twin");

    let outcome = engine.decrypt_folder(&data.join(".config"), None).await;
    assert!(!outcome.is_restored());
    assert!(data.join(".config").is_dir());
    assert!(!data.join("config").exists());
}

#[tokio::test]
async fn unknown_id_is_not_registered() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp).await;
    let err = engine.hide_item("nope").await.unwrap_err();
    assert!(matches!(err, CloakError::NotRegistered(_)));
}
