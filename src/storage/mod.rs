//! storage layer for dbvcs
//!
//! this module provides the data model (trees, commits, branches) and the
//! storage contracts the engine is written against. The engine never touches
//! git2 or a concrete backend directly; it only sees the two traits.
//!
//!  # Architecture
//!
//! ```text
//!  ┌───────────────────────────┐      ┌───────────────────────────┐
//!  │       ContentStore        │      │       MetadataStore       │
//!  │ (file bytes by SHA-256)   │      │ (commit sets, branches)   │
//!  └───────────────────────────┘      └───────────────────────────┘
//!         │           │                      │            │
//!         ▼           ▼                      ▼            ▼
//!  ┌───────────┐ ┌───────────┐        ┌───────────┐ ┌───────────┐
//!  │  memory   │ │    git    │        │  memory   │ │    git    │
//!  └───────────┘ └───────────┘        └───────────┘ └───────────┘
//!
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │  ───▶ │   commit    │  ◀─── │    refs     │
//!  │  (entries)  │       │  (history)  │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!  ```
//!
//! # Usage
//!
//! ```ignore
//! use dbvcs::storage::{CommitBuilder, ContentStore, Entry, GitBackend, Signature, Tree};
//!
//! let backend = GitBackend::open_or_init("./store")?;
//!
//! // store a file and describe it
//! let entry = Entry::store(&backend, "sales.sqlite", &bytes, modified)?;
//! let tree = Tree::new(vec![entry])?;
//!
//! // build a root commit
//! let commit = CommitBuilder::new()
//!     .tree(tree)
//!     .author(Signature::new("Alice", "alice@example.com"))
//!     .message("Initial upload.")
//!     .build()?;
//! ```

mod commit;
mod content;
mod error;
mod git;
mod memory;
mod persistence;
mod refs;
mod tree;
mod types;

// Re-export public API
pub use commit::{create_commit_id, Commit, CommitBuilder, CommitSet, FirstParentHistory};
pub use content::{verify_content, ContentStore};
pub use error::{StorageError, StorageResult};
pub use git::GitBackend;
pub use memory::{MemoryContentStore, MemoryMetadataStore};
pub use persistence::MetadataStore;
pub use refs::{Branch, BranchRegistry, HeadPrecondition};
pub use tree::{Entry, Tree, TreeBuilder};
pub use types::{
    format_timestamp, is_whole_seconds, truncate_to_seconds, BranchName, CommitId, ContentDigest, DatabaseId,
    InvalidDigestError, InvalidNameError, Signature, TreeId, DIGEST_LEN,
};
