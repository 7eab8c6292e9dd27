//! The worker pool is the only bound on simultaneously executing file tasks.

use std::path::PathBuf;
use std::sync::Arc;

use cloak_core::config::EngineConfig;
use cloak_crypto::{KdfParams, SecretKey};
use cloak_engine::{Engine, TaskOrchestrator, TransformMode, TransformTask};
use futures::future::join_all;
use secrecy::SecretString;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orchestrator_never_exceeds_pool_size() {
    let tmp = TempDir::new().unwrap();
    let key = Arc::new(SecretKey::from_bytes([0x10; 32]));
    let orchestrator = TaskOrchestrator::new(3, 4096, None);

    let sources: Vec<PathBuf> = (0..12)
        .map(|i| {
            let path = tmp.path().join(format!("src-{i}"));
            std::fs::write(&path, vec![i as u8; 256 * 1024]).unwrap();
            path
        })
        .collect();

    let runs = sources.iter().enumerate().map(|(i, src)| {
        orchestrator.run(
            TransformTask {
                mode: TransformMode::Encrypt,
                src: src.clone(),
                temp: tmp.path().join(format!("out-{i}")),
                key: key.clone(),
            },
            |_| {},
        )
    });
    for result in join_all(runs).await {
        assert_eq!(result.unwrap(), 256 * 1024);
    }

    assert!(orchestrator.peak_in_flight() >= 1);
    assert!(orchestrator.peak_in_flight() <= 3);
    assert_eq!(orchestrator.in_flight(), 0);
    orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn folder_fan_out_is_bounded_by_max_threads() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        max_threads: 2,
        chunk_size: 8192,
        store_path: tmp.path().join("store.db"),
        scratch_dir: Some(tmp.path().join("scratch")),
        ..Default::default()
    };
    let kdf = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    let engine = Engine::init(&SecretString::from("bounded"), config, kdf)
        .await
        .unwrap();

    let root = tmp.path().join("data/many");
    for sub in ["a", "b", "c"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
        for i in 0..6 {
            std::fs::write(root.join(sub).join(format!("f{i}.bin")), vec![7u8; 128 * 1024]).unwrap();
        }
    }

    let encrypted = engine.encrypt_folder(&root, None).await.unwrap();
    assert_eq!(engine.list_items().await.len(), 1 + 3 + 18);
    assert!(engine.orchestrator().peak_in_flight() <= 2);

    // Teardown then reuse: the pool restarts on demand.
    engine.shutdown();
    assert!(!engine.orchestrator().is_running());
    assert!(engine.decrypt_folder(&encrypted.path, None).await.is_restored());
    assert!(engine.orchestrator().is_running());
    assert!(engine.orchestrator().peak_in_flight() <= 2);
    engine.shutdown();
}
