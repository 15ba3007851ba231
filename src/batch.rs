//! Registry and batch convenience layer over many per-key managers sharing
//! one backend.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::warn;

use crate::core::types::is_sync_record;
use crate::core::{Payload, PersistenceMetadata, Result, StoreError, SyncStatus};
use crate::manager::PersistenceManager;
use crate::storage::KeyValueBackend;

/// Type-erased view of a registered manager, for paths that do not know the
/// payload type (quota eviction).
#[async_trait]
pub(crate) trait ManagerOps: Send + Sync {
    async fn delete_record(&self) -> Result<()>;
}

#[async_trait]
impl<T: Payload> ManagerOps for PersistenceManager<T> {
    async fn delete_record(&self) -> Result<()> {
        self.delete().await
    }
}

struct Registration {
    manager: Box<dyn Any + Send + Sync>,
    ops: Arc<dyn ManagerOps>,
}

struct BatchInner {
    backend: Arc<dyn KeyValueBackend>,
    managers: Mutex<HashMap<String, Registration>>,
}

/// Memoizes one [`PersistenceManager`] per key for the registry's lifetime,
/// so call sites sharing a key always share the same envelope bookkeeping.
///
/// Not a global: construct one per backend and pass it to whatever owns the
/// application's persistence lifecycle.
#[derive(Clone)]
pub struct BatchPersistenceManager {
    inner: Arc<BatchInner>,
}

/// One item of a [`BatchPersistenceManager::batch_save`] call.
pub struct BatchItem<T> {
    pub key: String,
    pub data: T,
    pub version: Option<u32>,
}

impl<T> BatchItem<T> {
    pub fn new(key: impl Into<String>, data: T) -> Self {
        Self {
            key: key.into(),
            data,
            version: None,
        }
    }

    pub fn versioned(key: impl Into<String>, data: T, version: u32) -> Self {
        Self {
            key: key.into(),
            data,
            version: Some(version),
        }
    }
}

/// Aggregate usage snapshot from a full backend scan.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// Every backend entry, managed or not.
    pub count: usize,
    /// Summed serialized size in bytes across all entries.
    pub estimated_size: usize,
    /// Maximum `last_sync` across managed records; `0` if none ever synced.
    pub last_sync: i64,
    /// Sync status per managed key.
    pub sync_status: HashMap<String, SyncStatus>,
}

impl BatchPersistenceManager {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                backend,
                managers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn KeyValueBackend> {
        self.inner.backend.clone()
    }

    /// Returns the manager registered for `key`, creating a version-1 manager
    /// on first use.
    pub fn create_manager<T: Payload>(&self, key: &str) -> Result<PersistenceManager<T>> {
        self.create_manager_versioned(key, 1)
    }

    /// First registration wins: a later call with a differing `version` still
    /// returns the originally configured manager. Re-registering a key under
    /// a different payload type is an error.
    pub fn create_manager_versioned<T: Payload>(
        &self,
        key: &str,
        version: u32,
    ) -> Result<PersistenceManager<T>> {
        let mut managers = self.lock_managers();
        if let Some(registration) = managers.get(key) {
            return registration
                .manager
                .downcast_ref::<PersistenceManager<T>>()
                .cloned()
                .ok_or_else(|| StoreError::PayloadType {
                    key: key.to_string(),
                });
        }

        let manager =
            PersistenceManager::<T>::with_version(self.inner.backend.clone(), key, version);
        managers.insert(
            key.to_string(),
            Registration {
                manager: Box::new(manager.clone()),
                ops: Arc::new(manager.clone()),
            },
        );
        Ok(manager)
    }

    /// Save every item concurrently. The first failure rejects the whole
    /// batch; saves that already completed stay persisted (no rollback).
    pub async fn batch_save<T: Payload>(&self, items: Vec<BatchItem<T>>) -> Result<()> {
        let mut saves = Vec::with_capacity(items.len());
        for item in items {
            let manager = match item.version {
                Some(version) => self.create_manager_versioned::<T>(&item.key, version)?,
                None => self.create_manager::<T>(&item.key)?,
            };
            saves.push(async move { manager.save(item.data).await });
        }
        try_join_all(saves).await?;
        Ok(())
    }

    /// Load each key's payload. Sequential on purpose, to bound backend load.
    pub async fn batch_load<T: Payload>(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, Option<T>>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            let manager = self.create_manager::<T>(key)?;
            let data = manager.load().await.map(|record| record.data);
            results.insert((*key).to_string(), data);
        }
        Ok(results)
    }

    /// Metadata for every managed record in the backend.
    ///
    /// This scans the whole backend, not just registered managers, so records
    /// left by earlier sessions are discovered too. Unmanaged keys (no
    /// envelope marker) are skipped.
    pub async fn get_all_metadata(&self) -> Result<HashMap<String, PersistenceMetadata>> {
        let mut metadata = HashMap::new();
        for (key, value) in self.inner.backend.entries().await? {
            if !is_sync_record(&value) {
                continue;
            }
            let Some(raw) = value.get("metadata") else {
                continue;
            };
            match serde_json::from_value::<PersistenceMetadata>(raw.clone()) {
                Ok(parsed) => {
                    metadata.insert(key, parsed);
                }
                Err(err) => {
                    warn!(%key, %err, "skipping record with malformed metadata");
                }
            }
        }
        Ok(metadata)
    }

    pub async fn get_storage_info(&self) -> Result<StorageInfo> {
        let entries = self.inner.backend.entries().await?;
        let count = entries.len();
        let mut estimated_size = 0usize;
        let mut sync_status = HashMap::new();
        let mut last_sync = 0i64;

        for (key, value) in entries {
            estimated_size += value.to_string().len();

            if !is_sync_record(&value) {
                continue;
            }
            let parsed = value
                .get("metadata")
                .and_then(|raw| serde_json::from_value::<PersistenceMetadata>(raw.clone()).ok());
            if let Some(meta) = parsed {
                sync_status.insert(key, meta.sync_status);
                last_sync = last_sync.max(meta.last_sync);
            }
        }

        Ok(StorageInfo {
            count,
            estimated_size,
            last_sync,
            sync_status,
        })
    }

    /// Drop the registry and wipe the backend. Irrecoverable.
    pub async fn clear_all(&self) -> Result<()> {
        self.lock_managers().clear();
        self.inner.backend.clear().await
    }

    pub(crate) fn registered_ops(&self, key: &str) -> Option<Arc<dyn ManagerOps>> {
        self.lock_managers()
            .get(key)
            .map(|registration| registration.ops.clone())
    }

    fn lock_managers(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        self.inner
            .managers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
