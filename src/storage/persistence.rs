//! Persistence contract for commit sets and branch registries.

use crate::storage::commit::CommitSet;
use crate::storage::error::StorageResult;
use crate::storage::refs::{Branch, BranchRegistry, HeadPrecondition};
use crate::storage::types::{BranchName, DatabaseId};

/// Durable storage for per-database metadata.
///
/// Every write is all-or-nothing: a failed call leaves the previously stored
/// value in place.
pub trait MetadataStore: Send + Sync {
    /// the stored commit set; empty for an unknown database
    fn load_commits(&self, db: &DatabaseId) -> StorageResult<CommitSet>;

    /// Merge `commits` into the stored set.
    ///
    /// Commits already stored are kept, so two writers can't drop each
    /// other's commits.
    fn store_commits(&self, db: &DatabaseId, commits: &CommitSet) -> StorageResult<()>;

    /// the stored branch registry; empty for an unknown database
    fn load_branches(&self, db: &DatabaseId) -> StorageResult<BranchRegistry>;

    /// replace the whole registry unconditionally
    fn store_branches(&self, db: &DatabaseId, branches: &BranchRegistry) -> StorageResult<()>;

    /// Atomically read, change and write back the registry.
    ///
    /// `change` sees the registry as currently stored and may be called
    /// more than once when another writer gets in first. If it fails,
    /// nothing is written and its error is returned. A registry that keeps
    /// moving is `Contended`.
    fn modify_branches(
        &self,
        db: &DatabaseId,
        change: &mut dyn FnMut(&mut BranchRegistry) -> StorageResult<()>,
    ) -> StorageResult<()>;

    /// Atomically replace one branch if it still satisfies `precondition`.
    ///
    /// Fails with `ConcurrentModification` when it doesn't.
    fn update_branch(
        &self,
        db: &DatabaseId,
        name: &BranchName,
        precondition: &HeadPrecondition,
        branch: Branch,
    ) -> StorageResult<()> {
        self.modify_branches(db, &mut |registry| {
            registry.update_branch_if(db, name, precondition, branch.clone())
        })
    }
}
