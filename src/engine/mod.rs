//! Commit, branch and merge engine.
//!
//! The engine records uploads as commits, moves branches with
//! compare-and-set, and performs fast-forward merges. It is written against
//! the storage traits only; backends, the identity resolver and the clock are
//! injected through [`Engine::builder`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │   (uploads, branches, history, fast-forward merges)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌──────────────┬──────┴───────┬──────────────┐
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐
//!  │  Content  │  │ Metadata  │  │ Identity  │  │   Clock   │
//!  │   Store   │  │   Store   │  │ Resolver  │  │           │
//!  └───────────┘  └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use dbvcs::engine::{AuthorSpec, Engine, MergeRequest, NewCommit};
//! use dbvcs::storage::{BranchName, DatabaseId, GitBackend};
//!
//! let engine = Engine::builder()
//!     .git_backend(GitBackend::open_or_init("./store")?)
//!     .identity_resolver(resolver)
//!     .build()?;
//!
//! let db = DatabaseId::new("alice", "sales.sqlite")?;
//! let upload = NewCommit::new(AuthorSpec::User("alice".into()))
//!     .file("sales.sqlite", bytes, modified);
//! engine.create_database(&db, upload)?;
//!
//! // later: bring a fork's commits back
//! let request = MergeRequest::new(BranchName::main(), fork_commits, "alice")
//!     .message("Merge changes from bob");
//! engine.merge_with_retry(&db, request)?;
//! ```

mod clock;
mod config;
mod error;
mod identity;
mod manager;
mod merge;

#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, ConfigViolation, EngineConfig};
pub use error::{EngineError, EngineResult, Missing};
pub use identity::{IdentityResolver, StaticIdentityResolver, UserIdentity};
pub use manager::{AuthorSpec, Engine, EngineBuilder, NewCommit, SnapshotFile};
pub use merge::MergeRequest;
