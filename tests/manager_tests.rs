//! Integration tests for per-key record management: history, backup,
//! restore, export/import, and change notification.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use syncvault::{
    FileBackend, KeyValueBackend, MemoryBackend, PersistenceManager, Result, StoreError,
    SyncStatus,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
}

fn profile(name: &str) -> Profile {
    Profile {
        name: name.to_string(),
    }
}

fn manager(backend: &Arc<MemoryBackend>) -> PersistenceManager<Profile> {
    PersistenceManager::new(backend.clone() as Arc<dyn KeyValueBackend>, "profile")
}

/// Backend whose writes always fail; reads succeed.
struct ReadOnlyBackend;

#[async_trait]
impl KeyValueBackend for ReadOnlyBackend {
    async fn get(&self, _key: &str) -> Result<Option<Value>> {
        Ok(None)
    }
    async fn set(&self, _key: &str, _value: Value) -> Result<()> {
        Err(StoreError::Backend("disk full".to_string()))
    }
    async fn del(&self, _key: &str) -> Result<()> {
        Err(StoreError::Backend("disk full".to_string()))
    }
    async fn clear(&self) -> Result<()> {
        Err(StoreError::Backend("disk full".to_string()))
    }
    async fn entries(&self) -> Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn first_save_creates_a_pending_record_with_no_backup() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    assert!(manager.load().await.is_none());

    manager.save(profile("A")).await.unwrap();
    let record = manager.load().await.unwrap();

    assert_eq!(record.data, profile("A"));
    assert_eq!(record.metadata.sync_status, SyncStatus::Pending);
    assert_eq!(record.metadata.version, 1);
    assert_eq!(record.metadata.last_sync, 0);
    assert!(record.metadata.last_modified > 0);
    assert!(!record.metadata.change_hash.is_empty());
    assert!(record.backup.is_none());
    assert!(record.history.is_empty());
}

#[tokio::test]
async fn backup_always_tracks_the_immediately_preceding_save() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    manager.save(profile("A")).await.unwrap();
    manager.save(profile("B")).await.unwrap();
    let record = manager.load().await.unwrap();
    assert_eq!(record.backup, Some(profile("A")));

    manager.save(profile("C")).await.unwrap();
    let record = manager.load().await.unwrap();
    assert_eq!(record.backup, Some(profile("B")));
}

#[tokio::test]
async fn history_is_bounded_and_evicts_oldest_first() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    for i in 0..12 {
        manager.save(profile(&format!("v{i}"))).await.unwrap();
        let history = manager.get_history().await;
        assert!(history.len() <= 10, "history exceeded bound after save {i}");
    }

    // Twelve saves push eleven prior values; the earliest (v0) is evicted.
    let history = manager.get_history().await;
    assert_eq!(history.len(), 10);
    assert_eq!(history.first().unwrap().version, profile("v1"));
    assert_eq!(history.last().unwrap().version, profile("v10"));
    let timestamps: Vec<i64> = history.iter().map(|entry| entry.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted, "history must stay oldest to newest");
}

#[tokio::test]
async fn change_hash_is_recomputed_from_the_new_payload() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    manager.save(profile("A")).await.unwrap();
    let hash_a = manager.load().await.unwrap().metadata.change_hash;

    manager.save(profile("B")).await.unwrap();
    let hash_b = manager.load().await.unwrap().metadata.change_hash;
    assert_ne!(hash_a, hash_b);

    manager.save(profile("B")).await.unwrap();
    let hash_b_again = manager.load().await.unwrap().metadata.change_hash;
    assert_eq!(hash_b, hash_b_again);
}

#[tokio::test]
async fn restore_version_requires_an_exact_timestamp() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    manager.save(profile("A")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    manager.save(profile("B")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    manager.save(profile("C")).await.unwrap();

    let history = manager.get_history().await;
    assert_eq!(history.len(), 2);
    let target = history[1].timestamp;

    // Near-misses change nothing.
    assert!(!manager.restore_version(target + 1).await.unwrap());
    assert_eq!(manager.load().await.unwrap().data, profile("C"));

    assert!(manager.restore_version(target).await.unwrap());
    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("B"));
    assert_eq!(record.metadata.sync_status, SyncStatus::Pending);
}

#[tokio::test]
async fn recover_from_backup_round_trips_the_previous_value() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    // No record, then no backup yet.
    assert!(!manager.recover_from_backup().await.unwrap());
    manager.save(profile("A")).await.unwrap();
    assert!(!manager.recover_from_backup().await.unwrap());

    manager.save(profile("B")).await.unwrap();
    assert!(manager.recover_from_backup().await.unwrap());

    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("A"));
    assert_eq!(record.backup, Some(profile("B")));
    assert_eq!(record.metadata.sync_status, SyncStatus::Pending);
    // Recovery is itself a save, so B lands in history.
    assert_eq!(record.history.last().unwrap().version, profile("B"));
}

#[tokio::test]
async fn export_import_reproduces_the_envelope() {
    let backend = Arc::new(MemoryBackend::new());
    let source = manager(&backend);

    source.save(profile("A")).await.unwrap();
    source.save(profile("B")).await.unwrap();
    let exported = source.export().await.unwrap();
    let original = source.load().await.unwrap();

    let other_backend = Arc::new(MemoryBackend::new());
    let target = manager(&other_backend);
    assert!(target.import(&exported).await);

    let imported = target.load().await.unwrap();
    assert_eq!(imported.data, original.data);
    assert_eq!(imported.metadata.version, original.metadata.version);
    assert_eq!(imported.metadata.change_hash, original.metadata.change_hash);
    assert_eq!(imported.backup, original.backup);
    assert_eq!(imported.history, original.history);
}

#[tokio::test]
async fn import_rejects_malformed_documents_without_writing() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    assert!(!manager.import("{not json").await);
    assert!(!manager.import("{\"unrelated\": true}").await);
    assert!(manager.load().await.is_none());
    assert_eq!(backend.len().await, 0);
}

#[tokio::test]
async fn clear_history_keeps_data_and_backup() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    manager.save(profile("A")).await.unwrap();
    manager.save(profile("B")).await.unwrap();
    assert_eq!(manager.get_history().await.len(), 1);

    manager.clear_history().await.unwrap();
    let record = manager.load().await.unwrap();
    assert!(record.history.is_empty());
    assert_eq!(record.data, profile("B"));
    assert_eq!(record.backup, Some(profile("A")));
}

#[tokio::test]
async fn load_swallows_corrupt_records_and_version_mismatches() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    backend.set("profile", json!("garbage")).await.unwrap();
    assert!(manager.load().await.is_none());

    manager.save(profile("A")).await.unwrap();

    // A manager configured for a newer schema still gets the record back.
    let newer: PersistenceManager<Profile> = PersistenceManager::with_version(
        backend.clone() as Arc<dyn KeyValueBackend>,
        "profile",
        2,
    );
    let record = newer.load().await.unwrap();
    assert_eq!(record.metadata.version, 1);
    assert_eq!(record.data, profile("A"));
}

#[tokio::test]
async fn write_failures_propagate_while_reads_degrade() {
    let backend: Arc<dyn KeyValueBackend> = Arc::new(ReadOnlyBackend);
    let manager: PersistenceManager<Profile> = PersistenceManager::new(backend, "profile");

    assert!(manager.load().await.is_none());
    assert!(matches!(
        manager.save(profile("A")).await,
        Err(StoreError::Backend(_))
    ));
    assert!(matches!(manager.delete().await, Err(StoreError::Backend(_))));
    assert!(!manager.import("{\"bad\": true}").await);
}

#[tokio::test]
async fn listeners_observe_saves_and_deletes_independently() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    let seen_a: Arc<Mutex<Vec<Option<Profile>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Arc<Mutex<Vec<Option<Profile>>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen_a.clone();
    let handle_a = manager.on_change(move |data| {
        sink.lock().unwrap().push(data.cloned());
    });
    let sink = seen_b.clone();
    let _handle_b = manager.on_change(move |data| {
        sink.lock().unwrap().push(data.cloned());
    });

    manager.save(profile("A")).await.unwrap();
    handle_a.unsubscribe();
    manager.delete().await.unwrap();

    assert_eq!(seen_a.lock().unwrap().as_slice(), &[Some(profile("A"))]);
    assert_eq!(
        seen_b.lock().unwrap().as_slice(),
        &[Some(profile("A")), None]
    );
}

#[tokio::test]
async fn end_to_end_profile_scenario() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = manager(&backend);

    manager.save(profile("A")).await.unwrap();
    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("A"));
    assert_eq!(record.metadata.sync_status, SyncStatus::Pending);
    assert!(record.history.is_empty());
    assert!(record.backup.is_none());

    manager.save(profile("B")).await.unwrap();
    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("B"));
    assert_eq!(record.backup, Some(profile("A")));
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.history[0].version, profile("A"));

    assert!(manager.recover_from_backup().await.unwrap());
    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("A"));
    assert_eq!(record.history.last().unwrap().version, profile("B"));
}

#[tokio::test]
async fn records_survive_reopening_a_file_backend() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.json");

    {
        let backend: Arc<dyn KeyValueBackend> = Arc::new(FileBackend::open(&path).unwrap());
        let manager: PersistenceManager<Profile> = PersistenceManager::new(backend, "profile");
        manager.save(profile("A")).await.unwrap();
        manager.save(profile("B")).await.unwrap();
    }

    let backend: Arc<dyn KeyValueBackend> = Arc::new(FileBackend::open(&path).unwrap());
    let manager: PersistenceManager<Profile> = PersistenceManager::new(backend, "profile");
    let record = manager.load().await.unwrap();
    assert_eq!(record.data, profile("B"));
    assert_eq!(record.backup, Some(profile("A")));
    assert_eq!(record.history.len(), 1);
}
