//! Error types shared across the synchronization pipeline

use crate::native::{NativeError, RevisionId};
use crate::object::ObjectId;
use crate::pack::PackError;
use crate::push::RepositoryFormat;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Errors surfaced by a synchronization call
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Raised before any walk begins.
    #[error("synchronizing from {from} into {to} is not supported")]
    UnsupportedDirection {
        from: RepositoryFormat,
        to: RepositoryFormat,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Native(#[from] NativeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("internal inconsistency: {0}")]
    Inconsistency(String),

    #[error("revision {revision} has parent {parent} without a commit hash")]
    UnresolvedParent {
        revision: RevisionId,
        parent: RevisionId,
    },

    #[error("revision {0} has no commit hash")]
    NotMapped(RevisionId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("synchronization interrupted")]
    Interrupted,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
