//! Single-file JSON backend with atomic replace on every mutation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::backend::KeyValueBackend;
use crate::core::{Result, StoreError};

/// Durable backend that keeps the whole namespace in one JSON document.
///
/// The document is loaded eagerly on open and rewritten on every mutation via
/// write-temp-then-rename, so a crash mid-write never leaves a torn file.
/// Suited to the small per-user namespaces this layer manages, not to bulk
/// storage.
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl FileBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = std::fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_out(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut temp, entries)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|err| StoreError::Io(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.write_out(&entries)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.write_out(&entries)?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.write_out(&entries)
    }

    async fn entries(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn survives_reopen() {
        tokio_test::block_on(async {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("vault.json");

            {
                let backend = FileBackend::open(&path).unwrap();
                backend.set("a", json!({"n": 1})).await.unwrap();
                backend.set("b", json!("two")).await.unwrap();
            }

            let reopened = FileBackend::open(&path).unwrap();
            assert_eq!(reopened.get("a").await.unwrap(), Some(json!({"n": 1})));
            assert_eq!(reopened.get("b").await.unwrap(), Some(json!("two")));
        });
    }

    #[test]
    fn clear_empties_the_document() {
        tokio_test::block_on(async {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("vault.json");

            let backend = FileBackend::open(&path).unwrap();
            backend.set("a", json!(1)).await.unwrap();
            backend.clear().await.unwrap();

            let reopened = FileBackend::open(&path).unwrap();
            assert!(reopened.entries().await.unwrap().is_empty());
        });
    }

    #[test]
    fn corrupt_document_fails_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(FileBackend::open(&path), Err(StoreError::Serde(_))));
    }
}
