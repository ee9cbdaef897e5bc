//! Behaviour every ContentStorage backend must share

use ctcache_content_store::{ContentStorage, FileContentStore, InMemoryContentStore};
use std::sync::Arc;
use tempfile::TempDir;

const ID_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const ID_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

async fn backends() -> (TempDir, Vec<Arc<dyn ContentStorage>>) {
    let dir = TempDir::new().unwrap();
    let file = FileContentStore::open(dir.path().join("blobs")).await.unwrap();
    let backends: Vec<Arc<dyn ContentStorage>> = vec![Arc::new(file), Arc::new(InMemoryContentStore::new())];
    (dir, backends)
}

#[tokio::test]
async fn test_absent_blob_reports_zero() {
    let (_dir, backends) = backends().await;
    for store in backends {
        assert!(store.get(ID_A).await.unwrap_err().is_not_found(), "{:?}", store);
        assert_eq!(store.size(ID_A).await.unwrap(), 0);
        assert_eq!(store.mtime(ID_A).await.unwrap(), 0.0);
        store.remove(ID_A).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_total_size_tracks_puts_and_removes() {
    let (_dir, backends) = backends().await;
    for store in backends {
        store.put(ID_A, &[1; 10]).await.unwrap();
        store.put(ID_B, &[2; 32]).await.unwrap();
        assert_eq!(store.total_size().await.unwrap(), 42);

        store.put(ID_A, &[3; 4]).await.unwrap();
        assert_eq!(store.total_size().await.unwrap(), 36);

        store.remove(ID_B).await.unwrap();
        assert_eq!(store.total_size().await.unwrap(), 4);
        assert_eq!(store.list().await.unwrap(), vec![ID_A.to_string()]);
        assert!(store.mtime(ID_A).await.unwrap() > 0.0);
    }
}

#[tokio::test]
async fn test_only_file_store_has_location() {
    let (dir, backends) = backends().await;
    assert_eq!(backends[0].location(), Some(dir.path().join("blobs").as_path()));
    assert_eq!(backends[1].location(), None);
}

#[tokio::test]
async fn test_file_store_reopens_existing_blobs() {
    let dir = TempDir::new().unwrap();
    {
        let store = FileContentStore::open(dir.path()).await.unwrap();
        store.put(ID_B, b"persisted").await.unwrap();
    }

    let reopened = FileContentStore::open(dir.path()).await.unwrap();
    assert_eq!(reopened.get(ID_B).await.unwrap(), b"persisted");
    assert_eq!(reopened.list().await.unwrap(), vec![ID_B.to_string()]);
}
