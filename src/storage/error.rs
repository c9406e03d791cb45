//! Storage layer error types
//!
//! All errors that can occur while reading or writing content, commits and
//! branches are defined here.

use thiserror::Error;

use crate::storage::types::{BranchName, CommitId, ContentDigest, InvalidDigestError, InvalidNameError};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// no object is stored under this digest
    #[error("blob not found: {0}")]
    BlobNotFound(ContentDigest),

    /// the commit is not part of the database's commit set
    #[error("commit not found: {0}")]
    CommitNotFound(CommitId),

    /// stored bytes don't match what their key promises
    #[error("corrupted data in {what}: {reason}")]
    CorruptedData { what: String, reason: String },

    /// the commit graph is broken (cycle, id mismatch)
    #[error("corrupted history at commit {commit}: {reason}")]
    CorruptedHistory { commit: CommitId, reason: String },

    /// branch update lost a compare-and-set race
    #[error("concurrent modification: branch {branch} of {database} was updated by another writer")]
    ConcurrentModification { database: String, branch: BranchName },

    /// a metadata document kept moving under concurrent writers
    #[error("metadata of {database} kept changing under concurrent writers")]
    Contended { database: String },

    /// invalid database or branch name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// a digest string could not be parsed
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] InvalidDigestError),

    /// failure injected by an in-memory store
    #[error("injected failure: {0}")]
    Injected(String),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BlobNotFound(_) | StorageError::CommitNotFound(_)
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification { .. } | StorageError::Contended { .. }
        )
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        self.is_conflict()
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::BlobNotFound(ContentDigest::of(b"x"));
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::ConcurrentModification {
            database: "alice/db.sqlite".to_string(),
            branch: BranchName::main(),
        };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());
        assert!(conflict.is_retriable());

        let contended = StorageError::Contended {
            database: "alice/db.sqlite".to_string(),
        };
        assert!(contended.is_conflict());
        assert!(contended.is_retriable());

        let injected = StorageError::Injected("disk full".to_string());
        assert!(!injected.is_retriable());
    }
}
