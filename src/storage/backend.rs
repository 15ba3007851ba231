use async_trait::async_trait;
use serde_json::Value;

use crate::core::Result;

/// Key-value storage capability the persistence layer writes through -
/// allows pluggable backends.
///
/// Values round-trip as plain JSON; implementations never interpret them.
/// The namespace is shared and ambient: every manager wired to the same
/// backend sees the same keys.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value wholesale.
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<()>;

    /// Wipe every key in the namespace.
    async fn clear(&self) -> Result<()>;

    /// Full enumeration, used by metadata and usage scans.
    async fn entries(&self) -> Result<Vec<(String, Value)>>;
}
