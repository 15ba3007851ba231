// ============================================================================
// syncvault Library
// ============================================================================

//! Versioned key-value persistence with change history, single-level backup,
//! pending-sync tracking, batching, quota management, and cross-key
//! migration.
//!
//! Every key holds a [`SyncRecord`] envelope: the current payload plus
//! metadata, the previous payload as a backup, and a bounded ring of prior
//! values. A [`PersistenceManager`] owns one key; a
//! [`BatchPersistenceManager`] memoizes managers per key over one shared
//! [`KeyValueBackend`].
//!
//! ```
//! use std::sync::Arc;
//! use syncvault::{BatchPersistenceManager, MemoryBackend, SyncStatus};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> syncvault::Result<()> {
//! let batch = BatchPersistenceManager::new(Arc::new(MemoryBackend::new()));
//!
//! let profile = batch.create_manager::<String>("profile")?;
//! profile.save("A".to_string()).await?;
//! profile.save("B".to_string()).await?;
//!
//! let record = profile.load().await.expect("just saved");
//! assert_eq!(record.data, "B");
//! assert_eq!(record.backup.as_deref(), Some("A"));
//! assert_eq!(record.metadata.sync_status, SyncStatus::Pending);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod core;
pub mod manager;
pub mod migration;
pub mod quota;
pub mod storage;

// Re-export main types for convenience
pub use crate::core::{
    EnvelopeKind, HistoryEntry, Payload, PersistenceMetadata, Result, StoreError, SyncRecord,
    SyncStatus,
};

pub use batch::{BatchItem, BatchPersistenceManager, StorageInfo};
pub use manager::{
    DEFAULT_AUTO_SYNC_INTERVAL, DEFAULT_MAX_HISTORY, ListenerHandle, MetadataPatch,
    PersistenceManager,
};
pub use migration::DataMigration;
pub use quota::{DEFAULT_MAX_SIZE_BYTES, StorageQuotaManager};
pub use storage::{FileBackend, KeyValueBackend, MemoryBackend};
