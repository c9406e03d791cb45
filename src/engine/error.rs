//! Engine error types.

use std::fmt;

use thiserror::Error;

use crate::engine::config::ConfigError;
use crate::storage::{BranchName, CommitId, ContentDigest, InvalidDigestError, InvalidNameError, StorageError};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// What a `NotFound` error couldn't find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Blob(ContentDigest),
    Commit(CommitId),
    Database(String),
    User(String),
    Entry { commit: CommitId, name: String },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Blob(digest) => write!(f, "blob {}", digest),
            Missing::Commit(id) => write!(f, "commit {}", id),
            Missing::Database(db) => write!(f, "database {}", db),
            Missing::User(name) => write!(f, "user '{}'", name),
            Missing::Entry { commit, name } => write!(f, "entry '{}' in commit {}", name, commit.short()),
        }
    }
}

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller supplied something the engine can't work with.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("branch '{branch}' not found in {database}")]
    BranchNotFound { database: String, branch: BranchName },

    #[error("branch '{branch}' already exists in {database}")]
    BranchExists { database: String, branch: BranchName },

    #[error("database {database} already exists")]
    DatabaseExists { database: String },

    /// The source history doesn't start at the destination head.
    #[error(
        "these changes can't be automatically merged into '{branch}' of {database}: \
         destination is at {}, source history starts from {}",
        .destination_head.short(),
        short_or_root(.source_base)
    )]
    MergeNotSupported {
        database: String,
        branch: BranchName,
        destination_head: CommitId,
        source_base: Option<CommitId>,
    },

    /// The branch moved while the operation ran - re-read and retry.
    #[error("branch '{branch}' of {database} moved while committing {}", .attempted.short())]
    Conflict {
        database: String,
        branch: BranchName,
        attempted: CommitId,
    },

    #[error("not found: {0}")]
    NotFound(Missing),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

fn short_or_root(id: &Option<CommitId>) -> String {
    match id {
        Some(id) => id.short(),
        None => "a root commit".to_string(),
    }
}

impl EngineError {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Conflict { .. } => true,
            EngineError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Check if the merge was rejected because it isn't a fast-forward.
    pub fn is_merge_not_supported(&self) -> bool {
        matches!(self, EngineError::MergeNotSupported { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_) | EngineError::BranchNotFound { .. })
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BlobNotFound(digest) => EngineError::NotFound(Missing::Blob(digest)),
            StorageError::CommitNotFound(id) => EngineError::NotFound(Missing::Commit(id)),
            StorageError::InvalidName(e) => EngineError::from(e),
            StorageError::InvalidDigest(e) => EngineError::from(e),
            other => EngineError::Storage(other),
        }
    }
}

impl From<InvalidNameError> for EngineError {
    fn from(err: InvalidNameError) -> Self {
        EngineError::invalid_input(err.to_string())
    }
}

impl From<InvalidDigestError> for EngineError {
    fn from(err: InvalidDigestError) -> Self {
        EngineError::invalid_input(err.to_string())
    }
}
