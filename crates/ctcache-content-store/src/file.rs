//! Filesystem implementation of ContentStorage
//!
//! Every blob is a regular file named after its identifier, with no extension,
//! directly inside the store directory. Writes go through a staging directory
//! and are renamed into place, so a reader sees either the old or the new blob.
//! Staged files left behind by a crash are removed when the store is opened,
//! or by [`ContentStorage::discard_incomplete`] once they are old enough.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{ContentStorage, ContentStoreError, ContentStoreResult};

/// Name of the staging directory inside the store directory
const STAGING_DIR: &str = ".staging";

/// Staged files older than this belong to no running write
pub const STALE_STAGED_AGE: Duration = Duration::from_secs(3600);

/// Blob store keeping one file per identifier
#[derive(Debug, Clone)]
pub struct FileContentStore {
    root: PathBuf,
    staging: PathBuf,
}

impl FileContentStore {
    /// Opens the store at `root`, creating the directory if needed.
    ///
    /// The store assumes it is the only writer of `root`: every staged file
    /// found at this point is a leftover and is deleted.
    pub async fn open(root: impl Into<PathBuf>) -> ContentStoreResult<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;

        let store = Self { root, staging };
        let removed = store.remove_staged_older_than(Duration::ZERO).await?;
        debug!(path = %store.root.display(), removed, "Opened file content store");
        Ok(store)
    }

    /// Deletes staged files last modified more than `age` ago
    pub async fn remove_staged_older_than(&self, age: Duration) -> ContentStoreResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.staging).await?;

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);
            if now.duration_since(modified).unwrap_or(Duration::ZERO) < age {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %entry.path().display(), error = %err, "Failed to remove staged blob"),
            }
        }

        if removed > 0 {
            info!(removed, path = %self.staging.display(), "Removed leftover staged blobs");
        }
        Ok(removed)
    }

    /// Path of the file holding the blob for `id`
    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn metadata(&self, id: &str) -> ContentStoreResult<Option<std::fs::Metadata>> {
        match fs::metadata(self.blob_path(id)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ContentStorage for FileContentStore {
    async fn put(&self, id: &str, content: &[u8]) -> ContentStoreResult<()> {
        let staged = self.staging.join(uuid::Uuid::new_v4().to_string());
        let written = match fs::write(&staged, content).await {
            Ok(()) => fs::rename(&staged, self.blob_path(id)).await,
            Err(err) => Err(err),
        };

        if let Err(err) = written {
            match fs::remove_file(&staged).await {
                Ok(()) => {}
                Err(cleanup_err) if cleanup_err.kind() == ErrorKind::NotFound => {}
                Err(cleanup_err) => {
                    warn!(path = %staged.display(), error = %cleanup_err, "Failed to remove staged blob")
                }
            }
            return Err(err.into());
        }

        debug!(%id, bytes = content.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, id: &str) -> ContentStoreResult<Vec<u8>> {
        match fs::read(self.blob_path(id)).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ContentStoreError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, id: &str) -> ContentStoreResult<()> {
        match fs::remove_file(self.blob_path(id)).await {
            Ok(()) => {
                debug!(%id, "Removed blob");
                Ok(())
            }
            // already removed
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn size(&self, id: &str) -> ContentStoreResult<u64> {
        Ok(self.metadata(id).await?.map(|meta| meta.len()).unwrap_or(0))
    }

    async fn mtime(&self, id: &str) -> ContentStoreResult<f64> {
        let Some(meta) = self.metadata(id).await? else {
            return Ok(0.0);
        };
        let modified = meta.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0))
    }

    async fn list(&self) -> ContentStoreResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => ids.push(name),
                Err(name) => warn!(?name, "Skipping blob with non UTF-8 name"),
            }
        }

        Ok(ids)
    }

    async fn discard_incomplete(&self) -> ContentStoreResult<usize> {
        self.remove_staged_older_than(STALE_STAGED_AGE).await
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HASH_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn create_store() -> (TempDir, FileContentStore) {
        let dir = TempDir::new().unwrap();
        let store = FileContentStore::open(dir.path().join("cache")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_dir, store) = create_store().await;

        store.put(HASH_A, b"warning: unused variable").await.unwrap();

        let content = store.get(HASH_A).await.unwrap();
        assert_eq!(content, b"warning: unused variable");
        assert!(store.blob_path(HASH_A).is_file());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (_dir, store) = create_store().await;

        store.put(HASH_A, b"first").await.unwrap();
        store.put(HASH_A, b"second payload").await.unwrap();

        assert_eq!(store.get(HASH_A).await.unwrap(), b"second payload");
        assert_eq!(store.size(HASH_A).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let (_dir, store) = create_store().await;

        match store.get(HASH_A).await {
            Err(ContentStoreError::NotFound(id)) => assert_eq!(id, HASH_A),
            other => panic!("Expected NotFound, got {other:?}"),
        }
        assert_eq!(store.size(HASH_A).await.unwrap(), 0);
        assert_eq!(store.mtime(HASH_A).await.unwrap(), 0.0);

        // Removing a missing blob is not an error
        store.remove(HASH_A).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove() {
        let (_dir, store) = create_store().await;

        store.put(HASH_A, b"content").await.unwrap();
        store.remove(HASH_A).await.unwrap();

        assert!(store.get(HASH_A).await.unwrap_err().is_not_found());
        assert!(!store.blob_path(HASH_A).exists());
    }

    #[tokio::test]
    async fn test_list_skips_staging_and_directories() {
        let (_dir, store) = create_store().await;

        store.put(HASH_A, b"a").await.unwrap();
        store.put(HASH_B, b"bb").await.unwrap();
        std::fs::create_dir(store.blob_path("nested")).unwrap();
        std::fs::write(store.blob_path("stray.txt"), b"xyz").unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![HASH_A.to_string(), HASH_B.to_string(), "stray.txt".to_string()]);

        assert_eq!(store.total_size().await.unwrap(), 6);
    }

    fn staged_files(store: &FileContentStore) -> usize {
        std::fs::read_dir(&store.staging).unwrap().count()
    }

    #[tokio::test]
    async fn test_open_removes_leftover_staged_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(root.join(STAGING_DIR)).unwrap();
        std::fs::write(root.join(STAGING_DIR).join("partial"), [0u8; 1000]).unwrap();

        let store = FileContentStore::open(&root).await.unwrap();

        assert_eq!(staged_files(&store), 0);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_put_leaves_nothing_staged() {
        let (_dir, store) = create_store().await;
        // a non-empty directory in the blob's place makes the rename fail
        std::fs::create_dir(store.blob_path(HASH_A)).unwrap();
        std::fs::write(store.blob_path(HASH_A).join("inner"), b"x").unwrap();

        assert!(store.put(HASH_A, b"payload").await.is_err());
        assert_eq!(staged_files(&store), 0);

        std::fs::remove_dir(&store.staging).unwrap();
        assert!(store.put(HASH_B, b"payload").await.is_err());
    }

    #[tokio::test]
    async fn test_discard_incomplete_spares_recent_writes() {
        let (_dir, store) = create_store().await;
        let old = store.staging.join("old");
        let recent = store.staging.join("recent");
        std::fs::write(&old, b"abandoned").unwrap();
        std::fs::write(&recent, b"in flight").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(SystemTime::now() - 2 * STALE_STAGED_AGE)
            .unwrap();

        assert_eq!(store.discard_incomplete().await.unwrap(), 1);
        assert!(!old.exists());
        assert!(recent.exists());
    }

    #[tokio::test]
    async fn test_mtime_is_recent() {
        let (_dir, store) = create_store().await;
        store.put(HASH_A, b"a").await.unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        let mtime = store.mtime(HASH_A).await.unwrap();
        assert!((now - mtime).abs() < 60.0);
    }

    #[tokio::test]
    async fn test_concurrent_puts_leave_one_complete_blob() {
        let (_dir, store) = create_store().await;
        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 4096]).collect();

        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = store.clone();
                tokio::spawn(async move { store.put(HASH_A, &payload).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get(HASH_A).await.unwrap();
        assert!(payloads.contains(&stored), "blob must be one of the written payloads");
        assert_eq!(store.list().await.unwrap(), vec![HASH_A.to_string()]);
    }
}
