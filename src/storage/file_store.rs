use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{CredentialStore, StoreError};

/// Durable store persisted as a single JSON object file.
///
/// Writes go to a sibling temp file which is then renamed over the
/// original, so a crash never leaves a half-written store behind.
#[derive(Debug)]
pub struct FileStore {
    name: String,
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load()
            .await?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
            debug!(store = %self.name, key, "removed durable entry");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("durable.json");
        let store = FileStore::new("durable", &path);

        store.set("auth.token", "t").await.unwrap();
        store.set("prefs.theme", "dark").await.unwrap();

        let reopened = FileStore::new("durable", &path);
        assert_eq!(reopened.get("auth.token").await.unwrap().as_deref(), Some("t"));
        assert_eq!(reopened.list_keys("auth.").await.unwrap(), vec!["auth.token"]);
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new("durable", dir.path().join("absent.json"));

        assert!(store.keys().await.unwrap().is_empty());
        store.remove("auth.token").await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_file_store_remove_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new("durable", dir.path().join("durable.json"));
        store.set("auth.token", "t").await.unwrap();
        store.set("goals.draft", "{}").await.unwrap();

        store.remove("auth.token").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["goals.draft"]);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_reports_serde_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("durable.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::new("durable", &path);
        let err = store.list_keys("auth.").await.unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)));
    }
}
