//! ctcache Content Store
//!
//! Provides the blob storage behind the cache: one payload per content hash.
//! The [`ContentStorage`] trait defines the contract; [`file::FileContentStore`]
//! keeps blobs as plain files named by hash, [`memory::InMemoryContentStore`]
//! keeps them in a map for tests and development.
//!
//! Stores key blobs by the raw identifier string and do not validate it.
//! Callers validate identifiers with [`CacheHash::parse`] before touching a store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::path::Path;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileContentStore;
pub use memory::InMemoryContentStore;

/// Length of a content hash in hexadecimal characters (a SHA-1 digest)
pub const HASH_LENGTH: usize = 40;

/// A validated content hash: exactly 40 hexadecimal characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheHash(String);

impl CacheHash {
    /// Validates `hash_str` and wraps it.
    pub fn parse(hash_str: &str) -> Result<Self, ContentStoreError> {
        if Self::is_valid(hash_str) {
            Ok(Self(hash_str.to_string()))
        } else {
            Err(ContentStoreError::InvalidHashFormat(hash_str.to_string()))
        }
    }

    /// Returns true if `hash_str` matches `^[0-9a-fA-F]{40}$`
    pub fn is_valid(hash_str: &str) -> bool {
        hash_str.len() == HASH_LENGTH && hash_str.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Get the string representation of the hash
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for CacheHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CacheHash {
    type Error = ContentStoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(ContentStoreError::InvalidHashFormat(value))
        }
    }
}

impl From<CacheHash> for String {
    fn from(hash: CacheHash) -> Self {
        hash.0
    }
}

/// Errors that can occur during content store operations
#[derive(Error, Debug)]
pub enum ContentStoreError {
    #[error("Content not found for hash: {0}")]
    NotFound(String),

    #[error("Invalid content hash format: {0}")]
    InvalidHashFormat(String),

    #[error("Storage backend error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContentStoreError {
    /// True for errors that mean "the blob does not exist"
    pub fn is_not_found(&self) -> bool {
        match self {
            ContentStoreError::NotFound(_) => true,
            ContentStoreError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            ContentStoreError::InvalidHashFormat(_) => false,
        }
    }
}

/// Result type for ContentStorage operations
pub type ContentStoreResult<T> = Result<T, ContentStoreError>;

/// Trait defining the contract for blob storage implementations
#[async_trait]
pub trait ContentStorage: Send + Sync + Debug {
    /// Writes or overwrites the blob stored under `id`
    async fn put(&self, id: &str, content: &[u8]) -> ContentStoreResult<()>;

    /// Reads the blob stored under `id`
    async fn get(&self, id: &str) -> ContentStoreResult<Vec<u8>>;

    /// Deletes the blob stored under `id`. A missing blob is not an error.
    async fn remove(&self, id: &str) -> ContentStoreResult<()>;

    /// Size of the blob in bytes, 0 if absent
    async fn size(&self, id: &str) -> ContentStoreResult<u64>;

    /// Modification time of the blob in seconds since the epoch, 0 if absent
    async fn mtime(&self, id: &str) -> ContentStoreResult<f64>;

    /// Identifiers of every blob currently stored
    async fn list(&self) -> ContentStoreResult<Vec<String>>;

    /// Sum of the sizes of every stored blob
    async fn total_size(&self) -> ContentStoreResult<u64> {
        let mut total = 0;
        for id in self.list().await? {
            total += self.size(&id).await?;
        }
        Ok(total)
    }

    /// Deletes partial writes that no running `put` will finish; returns how many
    async fn discard_incomplete(&self) -> ContentStoreResult<usize> {
        Ok(0)
    }

    /// Directory holding the blobs, if the store is backed by the filesystem
    fn location(&self) -> Option<&Path> {
        None
    }
}
