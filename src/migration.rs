//! Cross-key record transformation and merge.

use tracing::error;

use crate::batch::BatchPersistenceManager;
use crate::core::Payload;

/// Stateless migration helpers over keys registered through a
/// [`BatchPersistenceManager`].
///
/// Failures never panic or propagate; they are reported through return
/// values only. Callers that need detail can lower the tracing filter.
pub struct DataMigration;

impl DataMigration {
    /// Copy `source_key`'s payload through `transformer` into `target_key`
    /// under `target_version`. The source record is left fully intact.
    ///
    /// Returns `false` when the source is absent or any step fails.
    pub async fn migrate<T, R, F>(
        batch: &BatchPersistenceManager,
        source_key: &str,
        target_key: &str,
        transformer: F,
        target_version: u32,
    ) -> bool
    where
        T: Payload,
        R: Payload,
        F: FnOnce(T) -> R,
    {
        let source = match batch.create_manager::<T>(source_key) {
            Ok(manager) => manager,
            Err(err) => {
                error!(%source_key, %err, "migration failed");
                return false;
            }
        };
        let target = match batch.create_manager_versioned::<R>(target_key, target_version) {
            Ok(manager) => manager,
            Err(err) => {
                error!(%target_key, %err, "migration failed");
                return false;
            }
        };

        let Some(record) = source.load().await else {
            return false;
        };

        let transformed = transformer(record.data);
        if let Err(err) = target.save(transformed).await {
            error!(%source_key, %target_key, %err, "migration save failed");
            return false;
        }
        true
    }

    /// Merge both keys' payloads through `merger`, saving the result under
    /// `key1` only; `key2` is left untouched.
    ///
    /// Returns `None` when either record is absent or any step fails.
    pub async fn merge_data<T, F>(
        batch: &BatchPersistenceManager,
        key1: &str,
        key2: &str,
        merger: F,
    ) -> Option<T>
    where
        T: Payload,
        F: FnOnce(T, T) -> T,
    {
        let manager1 = match batch.create_manager::<T>(key1) {
            Ok(manager) => manager,
            Err(err) => {
                error!(key = %key1, %err, "merge failed");
                return None;
            }
        };
        let manager2 = match batch.create_manager::<T>(key2) {
            Ok(manager) => manager,
            Err(err) => {
                error!(key = %key2, %err, "merge failed");
                return None;
            }
        };

        let record1 = manager1.load().await?;
        let record2 = manager2.load().await?;

        let merged = merger(record1.data, record2.data);
        match manager1.save(merged.clone()).await {
            Ok(()) => Some(merged),
            Err(err) => {
                error!(key = %key1, %err, "merge save failed");
                None
            }
        }
    }
}
