//! In-memory implementation of ContentStorage
//!
//! This implementation is primarily intended for testing and development purposes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::{ContentStorage, ContentStoreError, ContentStoreResult};

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Vec<u8>,
    mtime: f64,
}

/// In-memory implementation of ContentStorage
///
/// All data is lost when the last clone of the instance is dropped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContentStore {
    blobs: Arc<RwLock<HashMap<String, StoredBlob>>>,
}

impl InMemoryContentStore {
    /// Create a new in-memory content store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// True if no blobs are stored
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ContentStorage for InMemoryContentStore {
    async fn put(&self, id: &str, content: &[u8]) -> ContentStoreResult<()> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(
            id.to_string(),
            StoredBlob {
                content: content.to_vec(),
                mtime: Self::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> ContentStoreResult<Vec<u8>> {
        let blobs = self.blobs.read().await;
        match blobs.get(id) {
            Some(blob) => Ok(blob.content.clone()),
            None => Err(ContentStoreError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> ContentStoreResult<()> {
        self.blobs.write().await.remove(id);
        Ok(())
    }

    async fn size(&self, id: &str) -> ContentStoreResult<u64> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(id).map(|blob| blob.content.len() as u64).unwrap_or(0))
    }

    async fn mtime(&self, id: &str) -> ContentStoreResult<f64> {
        let blobs = self.blobs.read().await;
        Ok(blobs.get(id).map(|blob| blob.mtime).unwrap_or(0.0))
    }

    async fn list(&self) -> ContentStoreResult<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn total_size(&self) -> ContentStoreResult<u64> {
        let blobs = self.blobs.read().await;
        Ok(blobs.values().map(|blob| blob.content.len() as u64).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve_content() {
        let store = InMemoryContentStore::new();
        store.put("blob-1", b"Test content").await.unwrap();

        let retrieved = store.get("blob-1").await.unwrap();
        assert_eq!(retrieved, b"Test content");
        assert_eq!(store.size("blob-1").await.unwrap(), 12);
        assert!(store.mtime("blob-1").await.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_get_nonexistent_content() {
        let store = InMemoryContentStore::new();

        match store.get("missing").await {
            Err(ContentStoreError::NotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("Expected ContentStoreError::NotFound, got {other:?}"),
        }
        assert_eq!(store.size("missing").await.unwrap(), 0);
        assert_eq!(store.mtime("missing").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_delete_content() {
        let store = InMemoryContentStore::new();
        store.put("blob-1", b"Content to delete").await.unwrap();

        store.remove("blob-1").await.unwrap();
        assert!(store.is_empty().await);

        // Delete again (should be idempotent)
        assert!(store.remove("blob-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_and_total_size() {
        let store = InMemoryContentStore::new();
        store.put("a", b"1").await.unwrap();
        store.put("b", b"22").await.unwrap();
        store.put("c", b"333").await.unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.total_size().await.unwrap(), 6);
        assert_eq!(store.len().await, 3);
    }
}
