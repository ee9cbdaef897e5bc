//! Error types for the ctcache server
//!
//! This module contains the error types used throughout the server.

use ctcache_content_store::ContentStoreError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Hash absent from the index; the expected outcome of a miss
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed client input, e.g. a hash that is not 40 hex characters
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Write key missing or wrong
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Blob storage failure
    #[error("Content store error: {0}")]
    StorageError(String),

    /// Index snapshot or statistics file failure
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

// Implement conversions from other error types
impl From<ContentStoreError> for ServerError {
    fn from(err: ContentStoreError) -> Self {
        match err {
            ContentStoreError::NotFound(hash) => ServerError::NotFound(format!("Cache entry {}", hash)),
            ContentStoreError::InvalidHashFormat(hash) => {
                ServerError::ValidationError(format!("Invalid cache hash format: {}", hash))
            }
            ContentStoreError::Io(err) => ServerError::StorageError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::PersistenceError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::InternalError(format!("Error: {}", err))
    }
}

impl ServerError {
    /// Check if the error is caused by the client rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::NotFound(_) | ServerError::ValidationError(_) | ServerError::Forbidden(_)
        )
    }
}
