//! Per-key record manager: versioned load/save, bounded history, single-level
//! backup, sync lifecycle, and change notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use crate::core::types::{change_hash, now_millis};
use crate::core::{HistoryEntry, Payload, PersistenceMetadata, Result, SyncRecord, SyncStatus};
use crate::storage::KeyValueBackend;

pub const DEFAULT_MAX_HISTORY: usize = 10;
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(30);

type SyncCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ChangeListener<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

/// Caller-supplied partial metadata merged over the stored metadata on save.
///
/// `version` and `last_modified` are always forced by the manager and cannot
/// be patched; `change_hash` is always recomputed from the new payload. A
/// save without an explicit status moves the record to `Pending`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataPatch {
    pub sync_status: Option<SyncStatus>,
    pub last_sync: Option<i64>,
}

impl MetadataPatch {
    pub fn status(sync_status: SyncStatus) -> Self {
        Self {
            sync_status: Some(sync_status),
            last_sync: None,
        }
    }

    pub fn pending() -> Self {
        Self::status(SyncStatus::Pending)
    }

    fn apply(&self, metadata: &mut PersistenceMetadata) {
        metadata.sync_status = self.sync_status.unwrap_or(SyncStatus::Pending);
        if let Some(last_sync) = self.last_sync {
            metadata.last_sync = last_sync;
        }
    }
}

struct ManagerState<T> {
    sync_callback: Option<SyncCallback<T>>,
    listeners: Vec<(u64, ChangeListener<T>)>,
    sync_task: Option<JoinHandle<()>>,
}

struct ManagerInner<T> {
    key: String,
    version: u32,
    max_history: usize,
    backend: Arc<dyn KeyValueBackend>,
    state: StdMutex<ManagerState<T>>,
    /// Serializes every load-modify-write on this key. The envelope is always
    /// rewritten wholesale, so overlapping writers would otherwise silently
    /// drop each other's backup/history bookkeeping.
    write_lock: Mutex<()>,
    listener_seq: AtomicU64,
}

/// Owns one logical record under one key.
///
/// Cheap to clone; clones share the underlying state, listeners, sync
/// callback and write lock, so every call site holding a clone operates on
/// the same envelope lineage.
pub struct PersistenceManager<T: Payload> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: Payload> std::fmt::Debug for PersistenceManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("key", &self.inner.key)
            .field("version", &self.inner.version)
            .finish_non_exhaustive()
    }
}

impl<T: Payload> Clone for PersistenceManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Payload> PersistenceManager<T> {
    pub fn new(backend: Arc<dyn KeyValueBackend>, key: impl Into<String>) -> Self {
        Self::with_version(backend, key, 1)
    }

    pub fn with_version(
        backend: Arc<dyn KeyValueBackend>,
        key: impl Into<String>,
        version: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                key: key.into(),
                version,
                max_history: DEFAULT_MAX_HISTORY,
                backend,
                state: StdMutex::new(ManagerState {
                    sync_callback: None,
                    listeners: Vec::new(),
                    sync_task: None,
                }),
                write_lock: Mutex::new(()),
                listener_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Load the record for this key.
    ///
    /// Read failures degrade to `None`: callers treat the result as "no data
    /// yet" and cannot distinguish absence from a failed read. A version
    /// mismatch is logged but the record is still returned unmigrated; it is
    /// the caller's job to run a migration if cross-version handling matters.
    pub async fn load(&self) -> Option<SyncRecord<T>> {
        let raw = match self.inner.backend.get(&self.inner.key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %self.inner.key, %err, "load failed, treating as absent");
                return None;
            }
        };

        let record: SyncRecord<T> = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %self.inner.key, %err, "stored record is malformed, treating as absent");
                return None;
            }
        };

        if record.metadata.version != self.inner.version {
            warn!(
                key = %self.inner.key,
                stored = record.metadata.version,
                expected = self.inner.version,
                "schema version mismatch, returning record unmigrated"
            );
        }

        Some(record)
    }

    /// Save a new payload, moving the record to `Pending`.
    pub async fn save(&self, data: T) -> Result<()> {
        self.save_with(data, MetadataPatch::default()).await
    }

    /// Save a new payload with caller-controlled metadata fields.
    ///
    /// The previous payload becomes the backup and is appended to the bounded
    /// history (oldest entries evicted first). Write failures propagate; a
    /// failed *sync* afterwards does not, since the local write already
    /// succeeded.
    pub async fn save_with(&self, data: T, patch: MetadataPatch) -> Result<()> {
        {
            let _guard = self.inner.write_lock.lock().await;
            self.write_envelope(data.clone(), patch).await?;
        }

        self.notify(Some(&data));
        self.spawn_trigger_sync(data);
        Ok(())
    }

    async fn write_envelope(&self, data: T, patch: MetadataPatch) -> Result<()> {
        let now = now_millis();

        let record = match self.load().await {
            Some(existing) => {
                let mut history = existing.history;
                // Trim before appending so at most max_history entries persist.
                if history.len() >= self.inner.max_history {
                    let excess = history.len() + 1 - self.inner.max_history;
                    history.drain(..excess);
                }
                history.push(HistoryEntry {
                    timestamp: now,
                    version: existing.data.clone(),
                });

                let mut metadata = existing.metadata;
                patch.apply(&mut metadata);
                metadata.version = self.inner.version;
                metadata.last_modified = now;
                metadata.change_hash = change_hash(&data)?;

                SyncRecord {
                    kind: Default::default(),
                    data,
                    metadata,
                    backup: Some(existing.data),
                    history,
                }
            }
            None => {
                let mut metadata = PersistenceMetadata::new(self.inner.version, now);
                patch.apply(&mut metadata);
                metadata.change_hash = change_hash(&data)?;

                SyncRecord {
                    kind: Default::default(),
                    data,
                    metadata,
                    backup: None,
                    history: Vec::new(),
                }
            }
        };

        let value = serde_json::to_value(&record)?;
        self.inner.backend.set(&self.inner.key, value).await
    }

    /// Remove the record entirely. Listeners are notified with `None`.
    pub async fn delete(&self) -> Result<()> {
        {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.backend.del(&self.inner.key).await?;
        }
        self.notify(None);
        Ok(())
    }

    pub async fn get_history(&self) -> Vec<HistoryEntry<T>> {
        self.load().await.map(|record| record.history).unwrap_or_default()
    }

    /// Restore the history entry whose timestamp matches exactly.
    ///
    /// No nearest-timestamp fuzzing; returns `false` (and changes nothing)
    /// when no entry matches.
    pub async fn restore_version(&self, timestamp: i64) -> Result<bool> {
        let Some(record) = self.load().await else {
            return Ok(false);
        };
        let Some(entry) = record
            .history
            .iter()
            .find(|entry| entry.timestamp == timestamp)
        else {
            return Ok(false);
        };

        self.save_with(entry.version.clone(), MetadataPatch::pending())
            .await?;
        Ok(true)
    }

    /// Re-save the single-level backup as current data, if one exists.
    pub async fn recover_from_backup(&self) -> Result<bool> {
        let Some(record) = self.load().await else {
            return Ok(false);
        };
        let Some(backup) = record.backup else {
            return Ok(false);
        };

        self.save_with(backup, MetadataPatch::pending()).await?;
        Ok(true)
    }

    pub async fn get_sync_status(&self) -> Option<PersistenceMetadata> {
        self.load().await.map(|record| record.metadata)
    }

    /// Install the external sync collaborator. Resolving means "durably
    /// accepted"; rejecting means "retry later".
    pub fn set_sync_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: SyncCallback<T> =
            Arc::new(move |data| Box::pin(callback(data)) as BoxFuture<'static, _>);
        self.state().sync_callback = Some(boxed);
    }

    /// Start the background sync poller. A no-op when already running.
    ///
    /// Each tick re-checks the stored record: only `Pending` records with a
    /// configured callback are pushed. The loop never propagates failures;
    /// they land in the record's status instead. The task keeps running until
    /// [`stop_auto_sync`](Self::stop_auto_sync) is called - callers own the
    /// symmetric stop.
    pub fn start_auto_sync(&self, interval: Duration) {
        let mut state = self.state();
        if let Some(task) = &state.sync_task {
            if !task.is_finished() {
                return;
            }
        }

        let manager = self.clone();
        state.sync_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it so the loop
            // fires at `interval` after start, not at start.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.auto_sync_tick().await;
            }
        }));
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.state().sync_task.take() {
            task.abort();
        }
    }

    async fn auto_sync_tick(&self) {
        let Some(record) = self.load().await else {
            return;
        };
        if record.metadata.sync_status != SyncStatus::Pending {
            return;
        }
        let Some(callback) = self.state().sync_callback.clone() else {
            return;
        };

        self.complete_sync(callback, record.data, false).await;
    }

    /// Subscribe to changes. The listener runs synchronously after every
    /// successful save/import (`Some`) and delete (`None`).
    pub fn on_change<F>(&self, listener: F) -> ListenerHandle<T>
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let id = self.inner.listener_seq.fetch_add(1, Ordering::Relaxed);
        self.state().listeners.push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Serialize the full envelope for backup portability. `None` when no
    /// record exists.
    pub async fn export(&self) -> Option<String> {
        let record = self.load().await?;
        match serde_json::to_string_pretty(&record) {
            Ok(json) => Some(json),
            Err(err) => {
                warn!(key = %self.inner.key, %err, "export serialization failed");
                None
            }
        }
    }

    /// Replace the entire envelope with a previously exported one.
    ///
    /// Parsing happens before any write; a malformed document leaves the
    /// store untouched and returns `false`.
    pub async fn import(&self, json: &str) -> bool {
        let record: SyncRecord<T> = match serde_json::from_str(json) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = %self.inner.key, %err, "import rejected: malformed envelope");
                return false;
            }
        };
        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(err) => {
                warn!(key = %self.inner.key, %err, "import re-serialization failed");
                return false;
            }
        };

        let write = {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.backend.set(&self.inner.key, value).await
        };

        match write {
            Ok(()) => {
                self.notify(Some(&record.data));
                true
            }
            Err(err) => {
                warn!(key = %self.inner.key, %err, "import write failed");
                false
            }
        }
    }

    /// Empty the history ring in place; data, backup and metadata survive.
    pub async fn clear_history(&self) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let Some(mut record) = self.load().await else {
            return Ok(());
        };
        record.history.clear();
        let value = serde_json::to_value(&record)?;
        self.inner.backend.set(&self.inner.key, value).await
    }

    fn spawn_trigger_sync(&self, data: T) {
        let Some(callback) = self.state().sync_callback.clone() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager
                .update_sync_status(SyncStatus::Pending, None)
                .await
            {
                error!(key = %manager.inner.key, %err, "failed to mark record pending before sync");
                return;
            }
            manager.complete_sync(callback, data, true).await;
        });
    }

    async fn complete_sync(&self, callback: SyncCallback<T>, data: T, stamp_last_sync: bool) {
        match callback(data).await {
            Ok(()) => {
                let last_sync = stamp_last_sync.then(now_millis);
                if let Err(err) = self.update_sync_status(SyncStatus::Synced, last_sync).await {
                    error!(key = %self.inner.key, %err, "failed to record successful sync");
                }
            }
            Err(err) => {
                error!(key = %self.inner.key, %err, "sync failed");
                if let Err(err) = self.update_sync_status(SyncStatus::Failed, None).await {
                    error!(key = %self.inner.key, %err, "failed to record sync failure");
                }
            }
        }
    }

    /// Metadata-only rewrite used by the sync paths. Data, backup and history
    /// are left untouched.
    async fn update_sync_status(&self, status: SyncStatus, last_sync: Option<i64>) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let Some(mut record) = self.load().await else {
            return Ok(());
        };
        record.metadata.sync_status = status;
        if let Some(last_sync) = last_sync {
            record.metadata.last_sync = last_sync;
        }
        let value = serde_json::to_value(&record)?;
        self.inner.backend.set(&self.inner.key, value).await
    }

    fn notify(&self, data: Option<&T>) {
        let listeners: Vec<ChangeListener<T>> = self
            .state()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(data);
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its listener when consumed; other listeners are unaffected.
pub struct ListenerHandle<T: Payload> {
    id: u64,
    inner: Weak<ManagerInner<T>>,
}

impl<T: Payload> ListenerHandle<T> {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
