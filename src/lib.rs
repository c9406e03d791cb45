//! dbvcs - version control for hosted database files
//!
//! Every upload of a database file becomes a commit over a content-addressed
//! tree. Branches are named pointers moved with compare-and-set, and a
//! fork's linear chain of commits can be fast-forward merged back.
//!
//! - [`storage`]: digests, trees, commits, branch registries and the
//!   content/metadata store traits with in-memory and git backends
//! - [`engine`]: uploads, branch management, history and merges
//! - [`logging`]: subscriber setup for binaries
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use dbvcs::engine::{AuthorSpec, Engine, NewCommit};
//! use dbvcs::storage::{BranchName, DatabaseId, GitBackend, Signature};
//!
//! let engine = Engine::builder()
//!     .git_backend(GitBackend::open_or_init("./store").unwrap())
//!     .build()
//!     .unwrap();
//!
//! let db = DatabaseId::new("alice", "sales.sqlite").unwrap();
//! let author = AuthorSpec::Explicit(Signature::new("Alice", "alice@example.com"));
//! let upload = NewCommit::new(author).file("sales.sqlite", b"...".to_vec(), Utc::now());
//! engine.create_database(&db, upload).unwrap();
//!
//! let history = engine.history(&db, &BranchName::main()).unwrap();
//! assert_eq!(history.len(), 1);
//! ```

pub mod engine;
pub mod logging;
pub mod storage;
