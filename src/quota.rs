//! Usage polling and eviction of confirmed-synced records.

use crate::batch::BatchPersistenceManager;
use crate::core::{Result, SyncStatus};

pub const DEFAULT_MAX_SIZE_BYTES: usize = 50 * 1024 * 1024;

const WARNING_THRESHOLD: f64 = 0.8;
const CLEANUP_BATCH_LIMIT: usize = 10;

/// Watches aggregate storage usage and evicts old records when the namespace
/// approaches its size budget.
pub struct StorageQuotaManager {
    batch: BatchPersistenceManager,
    max_size_bytes: usize,
}

impl StorageQuotaManager {
    pub fn new(batch: BatchPersistenceManager) -> Self {
        Self::with_max_size(batch, DEFAULT_MAX_SIZE_BYTES)
    }

    pub fn with_max_size(batch: BatchPersistenceManager, max_size_bytes: usize) -> Self {
        Self {
            batch,
            max_size_bytes,
        }
    }

    pub async fn usage_percent(&self) -> Result<f64> {
        let info = self.batch.get_storage_info().await?;
        Ok(info.estimated_size as f64 / self.max_size_bytes as f64)
    }

    pub async fn is_near_capacity(&self) -> Result<bool> {
        Ok(self.usage_percent().await? >= WARNING_THRESHOLD)
    }

    /// Evict up to ten `Synced` records, oldest-`last_modified` first, and
    /// return how many were deleted.
    ///
    /// Only confirmed-synced data is droppable; `Pending`, `Failed` and
    /// `Offline` records are never touched by this routine.
    pub async fn cleanup(&self) -> Result<usize> {
        let metadata = self.batch.get_all_metadata().await?;

        let mut candidates: Vec<_> = metadata
            .into_iter()
            .filter(|(_, meta)| meta.sync_status == SyncStatus::Synced)
            .collect();
        candidates.sort_by_key(|(_, meta)| meta.last_modified);
        candidates.truncate(CLEANUP_BATCH_LIMIT);

        let mut deleted = 0usize;
        for (key, _) in candidates {
            // Prefer the registered manager so change listeners observe the
            // eviction; fall back to the backend for keys from past sessions.
            match self.batch.registered_ops(&key) {
                Some(ops) => ops.delete_record().await?,
                None => self.batch.backend().del(&key).await?,
            }
            deleted += 1;
        }
        Ok(deleted)
    }
}
