use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::Result;

/// Envelope discriminant written on every save so backend scans can tell
/// managed records apart from unrelated keys sharing the namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[default]
    #[serde(rename = "sync-record")]
    SyncRecord,
}

pub const ENVELOPE_KIND_FIELD: &str = "kind";
pub const ENVELOPE_KIND_TAG: &str = "sync-record";

/// Per-record sync lifecycle. `Failed` and `Synced` are both revisitable;
/// any new save moves a record back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
    Offline,
}

/// Metadata attached to every stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceMetadata {
    /// Schema version the record was written under.
    pub version: u32,
    /// Epoch ms of the last successful external sync; `0` if never synced.
    pub last_sync: i64,
    /// Epoch ms of the last local write.
    pub last_modified: i64,
    pub sync_status: SyncStatus,
    /// Digest of the payload, recomputed fresh on every save.
    pub change_hash: String,
}

impl PersistenceMetadata {
    pub fn new(version: u32, now: i64) -> Self {
        Self {
            version,
            last_sync: 0,
            last_modified: now,
            sync_status: SyncStatus::Pending,
            change_hash: String::new(),
        }
    }
}

/// One prior payload value, keyed by the save timestamp that displaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub timestamp: i64,
    pub version: T,
}

/// The envelope actually persisted per key. Always written wholesale; the
/// backend has no partial-update primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord<T> {
    #[serde(default)]
    pub kind: EnvelopeKind,
    pub data: T,
    pub metadata: PersistenceMetadata,
    /// The payload immediately prior to the most recent save.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub backup: Option<T>,
    /// Prior payloads, oldest first, capped at the manager's history bound.
    #[serde(default = "Vec::new")]
    pub history: Vec<HistoryEntry<T>>,
}

/// Whether a raw backend value carries the managed-envelope marker.
pub fn is_sync_record(value: &serde_json::Value) -> bool {
    value.get(ENVELOPE_KIND_FIELD).and_then(|kind| kind.as_str()) == Some(ENVELOPE_KIND_TAG)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Deterministic digest of a payload. The contract is determinism and
/// sensitivity to payload changes, not a specific algorithm; a truncated
/// SHA-256 over the serialized form satisfies both.
pub fn change_hash<T: Serialize>(data: &T) -> Result<String> {
    let serialized = serde_json::to_vec(data)?;
    let digest = Sha256::digest(&serialized);
    Ok(hex::encode(&digest[..8]))
}

/// Anything the storage backend can round-trip through structured
/// serialization. Blanket-implemented; embedders never implement it by hand.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
