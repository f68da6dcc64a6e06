//! Local persistence layers shared with the rest of the client.
//!
//! The guard never reads these stores for its own state. It only deletes
//! credential-namespaced keys from them during a cleanup cascade.

pub mod file_store;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

pub use file_store::FileStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store contents could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value layer holding credential material among unrelated data.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Human readable name used in logs and stage reports.
    fn name(&self) -> &str;

    /// Keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Remove a single key. Absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Every key in the store.
    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.list_keys("").await
    }
}

/// In-process store: the ephemeral per-process layer and the ambient
/// artifact jar.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().await.insert(key.into(), value.into());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_lists_by_prefix() {
        let store = MemoryStore::new("ephemeral");
        store.set("auth.token", "t").await;
        store.set("auth.refresh", "r").await;
        store.set("habits.cache", "[]").await;

        let mut keys = store.list_keys("auth.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["auth.refresh", "auth.token"]);
        assert_eq!(store.keys().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_remove_missing_is_ok() {
        let store = MemoryStore::new("ephemeral");
        store.set("auth.token", "t").await;

        store.remove("auth.token").await.unwrap();
        store.remove("auth.token").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_store_clone_shares_entries() {
        let store = MemoryStore::new("ambient");
        let cloned = store.clone();

        cloned.set("session.cookie", "abc").await;
        assert_eq!(store.get("session.cookie").await.as_deref(), Some("abc"));
        assert_eq!(store.name(), "ambient");
    }
}
