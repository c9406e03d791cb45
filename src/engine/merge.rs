//! Fast-forward merges.
//!
//! A merge takes a linear chain of commits made elsewhere (a fork or another
//! branch) whose oldest commit sits directly on the destination's head, and
//! records them on the destination followed by a merge commit:
//!
//! ```text
//!   before:   D  <- destination head
//!             ^
//!             S1 <- S2             source chain
//!
//!   after:    D <------------ M    M.parent = source[0], M.other_parents = [D]
//!             ^               |
//!             S1 <- S2        +-> source[0]
//! ```
//!
//! Anything else (the destination moved on, the chain starts elsewhere) is
//! rejected with `MergeNotSupported`; there is no three-way merge.

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn};
use ulid::Ulid;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::manager::{AuthorSpec, Engine};
use crate::storage::{BranchName, Commit, CommitBuilder, CommitId, DatabaseId, HeadPrecondition};

/// A request to merge a chain of commits into a branch.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub destination: BranchName,
    /// one linear chain, newest first or oldest first
    pub source_commits: Vec<Commit>,
    pub message: String,
    /// username the merge commit is attributed to
    pub acting_user: String,
    /// defaults to the engine clock
    pub timestamp: Option<DateTime<Utc>>,
}

impl MergeRequest {
    pub fn new(destination: BranchName, source_commits: Vec<Commit>, acting_user: impl Into<String>) -> Self {
        Self {
            destination,
            source_commits,
            message: String::new(),
            acting_user: acting_user.into(),
            timestamp: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The commit of a linear chain whose parent lies outside the chain.
///
/// Accepts newest-first (each parent is the next element) and oldest-first
/// (each parent is the previous element) orderings.
pub(crate) fn chain_base(commits: &[Commit]) -> EngineResult<&Commit> {
    let (first, last) = match (commits.first(), commits.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(EngineError::invalid_input("merge needs at least one source commit")),
    };
    if commits.len() == 1 {
        return Ok(first);
    }
    if commits.windows(2).all(|w| w[0].parent == Some(w[1].id)) {
        return Ok(last);
    }
    if commits.windows(2).all(|w| w[1].parent == Some(w[0].id)) {
        return Ok(first);
    }
    Err(EngineError::invalid_input("source commits don't form a single linear chain"))
}

impl Engine {
    /// Fast-forward merge `request.source_commits` into `request.destination`.
    ///
    /// Returns the id of the new merge commit. A lost race on the branch
    /// head comes back as `Conflict`; calling again with the same request
    /// and timestamp produces the same merge commit.
    pub fn merge(&self, db: &DatabaseId, request: MergeRequest) -> EngineResult<CommitId> {
        let _span = info_span!(
            "merge",
            operation_id = %Ulid::new(),
            database = %db,
            branch = %request.destination,
            sources = request.source_commits.len()
        )
        .entered();

        let timestamp = request.timestamp.unwrap_or_else(|| self.now());
        self.merge_at(db, &request, timestamp)
    }

    /// Like [`merge`](Self::merge), retrying on `Conflict` up to
    /// `max_merge_attempts` times with one fixed timestamp.
    pub fn merge_with_retry(&self, db: &DatabaseId, request: MergeRequest) -> EngineResult<CommitId> {
        let _span = info_span!(
            "merge_with_retry",
            operation_id = %Ulid::new(),
            database = %db,
            branch = %request.destination,
            sources = request.source_commits.len()
        )
        .entered();

        let timestamp = request.timestamp.unwrap_or_else(|| self.now());
        let max_attempts = self.config().max_merge_attempts;
        let mut attempt = 1;
        loop {
            match self.merge_at(db, &request, timestamp) {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %e, "merge lost a race, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn merge_at(&self, db: &DatabaseId, request: &MergeRequest, timestamp: DateTime<Utc>) -> EngineResult<CommitId> {
        let base = chain_base(&request.source_commits)?;
        for commit in &request.source_commits {
            commit.verify_id().map_err(|_| {
                EngineError::invalid_input(format!(
                    "source commit {} doesn't match its contents",
                    commit.id.short()
                ))
            })?;
        }

        let destination = self.branch(db, &request.destination)?;
        let dest_head = destination.head;
        if base.parent != Some(dest_head) {
            warn!(
                destination_head = %dest_head.short(),
                source_base = ?base.parent.map(|p| p.short()),
                "rejected merge that isn't a fast-forward"
            );
            return Err(EngineError::MergeNotSupported {
                database: db.to_string(),
                branch: request.destination.clone(),
                destination_head: dest_head,
                source_base: base.parent,
            });
        }

        let mut commits = self.commits(db)?;
        commits.union(request.source_commits.iter().cloned());

        let author = self.resolve_author(&AuthorSpec::User(request.acting_user.clone()))?;
        let tip = &request.source_commits[0];
        let merge = CommitBuilder::new()
            .tree(tip.tree.clone())
            .parent(tip.id)
            .other_parent(dest_head)
            .author(author)
            .message(request.message.clone())
            .timestamp(timestamp)
            .build()?;
        let merge_id = merge.id;
        commits.insert(merge);

        let added = request.source_commits.len() as u64 + 1;
        let updated = destination.advanced(merge_id, added);
        let commit_count = updated.commit_count;

        self.metadata_store().store_commits(db, &commits)?;
        self.advance_branch(db, &request.destination, HeadPrecondition::Head(dest_head), updated)?;

        info!(commit = %merge_id.short(), previous = %dest_head.short(), commit_count, "merged");
        Ok(merge_id)
    }
}
