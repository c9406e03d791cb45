//! In-process backends.
//!
//! Both stores keep everything behind a `parking_lot` lock and are cheap to
//! share through an `Arc`. The metadata store can be told to fail its next
//! write, which is how tests exercise the "nothing visible after a failed
//! merge" paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::storage::commit::CommitSet;
use crate::storage::content::ContentStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::persistence::MetadataStore;
use crate::storage::refs::BranchRegistry;
use crate::storage::types::{ContentDigest, DatabaseId};

/// content store backed by a hash map
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<ContentDigest, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of objects actually written (deduplicated puts don't count)
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn put(&self, bytes: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::of(bytes);
        let mut objects = self.objects.write();
        if !objects.contains_key(&digest) {
            objects.insert(digest, bytes.to_vec());
            self.writes.fetch_add(1, Ordering::SeqCst);
            debug!(digest = %digest.short(), size = bytes.len(), "stored object");
        }
        Ok(digest)
    }

    fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        self.objects
            .read()
            .get(digest)
            .cloned()
            .ok_or(StorageError::BlobNotFound(*digest))
    }

    fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.objects.read().contains_key(digest))
    }
}

#[derive(Debug, Default)]
struct MetadataState {
    commits: HashMap<DatabaseId, CommitSet>,
    branches: HashMap<DatabaseId, BranchRegistry>,
    fail_commit_store: bool,
    fail_branch_store: bool,
    lose_branch_race: bool,
}

/// metadata store backed by hash maps, with failure injection
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MetadataState>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// make the next `store_commits` call fail without storing anything
    pub fn fail_next_commit_store(&self) {
        self.state.lock().fail_commit_store = true;
    }

    /// make the next `store_branches` or branch update fail without storing
    /// anything
    pub fn fail_next_branch_store(&self) {
        self.state.lock().fail_branch_store = true;
    }

    /// make the next branch update report a lost race
    pub fn lose_next_branch_race(&self) {
        self.state.lock().lose_branch_race = true;
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn load_commits(&self, db: &DatabaseId) -> StorageResult<CommitSet> {
        Ok(self.state.lock().commits.get(db).cloned().unwrap_or_default())
    }

    fn store_commits(&self, db: &DatabaseId, commits: &CommitSet) -> StorageResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_commit_store) {
            return Err(StorageError::Injected(format!("store_commits for {}", db)));
        }
        let stored = state.commits.entry(db.clone()).or_default();
        let added = stored.union(commits.iter().cloned());
        debug!(database = %db, added, total = stored.len(), "stored commits");
        Ok(())
    }

    fn load_branches(&self, db: &DatabaseId) -> StorageResult<BranchRegistry> {
        Ok(self.state.lock().branches.get(db).cloned().unwrap_or_default())
    }

    fn store_branches(&self, db: &DatabaseId, branches: &BranchRegistry) -> StorageResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_branch_store) {
            return Err(StorageError::Injected(format!("store_branches for {}", db)));
        }
        state.branches.insert(db.clone(), branches.clone());
        Ok(())
    }

    fn modify_branches(
        &self,
        db: &DatabaseId,
        change: &mut dyn FnMut(&mut BranchRegistry) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_branch_store) {
            return Err(StorageError::Injected(format!("branch update for {}", db)));
        }
        if std::mem::take(&mut state.lose_branch_race) {
            return Err(StorageError::Contended {
                database: db.to_string(),
            });
        }
        let mut registry = state.branches.get(db).cloned().unwrap_or_default();
        change(&mut registry)?;
        state.branches.insert(db.clone(), registry);
        debug!(database = %db, "updated branches");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::refs::{Branch, HeadPrecondition};
    use crate::storage::types::{BranchName, CommitId};

    fn db() -> DatabaseId {
        DatabaseId::new("alice", "stats.sqlite").unwrap()
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = MemoryContentStore::new();
        let a = store.put(b"SQLite format 3").unwrap();
        let b = store.put(b"SQLite format 3").unwrap();

        assert_eq!(a, b);
        assert_eq!(store.writes(), 1);
        assert_eq!(store.get(&a).unwrap(), b"SQLite format 3");
        assert!(store.contains(&a).unwrap());
    }

    #[test]
    fn test_get_missing() {
        let store = MemoryContentStore::new();
        let result = store.get(&ContentDigest::of(b"never stored"));
        assert!(matches!(result, Err(StorageError::BlobNotFound(_))));
    }

    #[test]
    fn test_unknown_database_is_empty() {
        let store = MemoryMetadataStore::new();
        assert!(store.load_commits(&db()).unwrap().is_empty());
        assert!(store.load_branches(&db()).unwrap().is_empty());
    }

    #[test]
    fn test_injected_failures_store_nothing() {
        let store = MemoryMetadataStore::new();
        let mut registry = BranchRegistry::new();
        registry.insert(BranchName::main(), Branch::new(CommitId::from_bytes([1; 32]), 1));

        store.fail_next_branch_store();
        assert!(matches!(
            store.store_branches(&db(), &registry),
            Err(StorageError::Injected(_))
        ));
        assert!(store.load_branches(&db()).unwrap().is_empty());

        // only the next call fails
        store.store_branches(&db(), &registry).unwrap();
        assert_eq!(store.load_branches(&db()).unwrap(), registry);

        store.fail_next_commit_store();
        assert!(store.store_commits(&db(), &CommitSet::new()).is_err());
        assert!(store.store_commits(&db(), &CommitSet::new()).is_ok());
    }

    #[test]
    fn test_lost_race() {
        let store = MemoryMetadataStore::new();
        let main = BranchName::main();
        let head = CommitId::from_bytes([1; 32]);

        store.lose_next_branch_race();
        let result = store.update_branch(&db(), &main, &HeadPrecondition::Absent, Branch::new(head, 1));
        assert!(result.unwrap_err().is_conflict());
        assert!(store.load_branches(&db()).unwrap().is_empty());

        store
            .update_branch(&db(), &main, &HeadPrecondition::Absent, Branch::new(head, 1))
            .unwrap();
        assert_eq!(store.load_branches(&db()).unwrap().get(&main).unwrap().head, head);
    }

    #[test]
    fn test_failed_change_stores_nothing() {
        let store = MemoryMetadataStore::new();
        let main = BranchName::main();
        store
            .update_branch(&db(), &main, &HeadPrecondition::Absent, Branch::new(CommitId::from_bytes([1; 32]), 1))
            .unwrap();
        let before = store.load_branches(&db()).unwrap();

        let result = store.modify_branches(&db(), &mut |registry| {
            registry.remove(&BranchName::main());
            Err(StorageError::Internal("abandon".to_string()))
        });
        assert!(matches!(result, Err(StorageError::Internal(_))));
        assert_eq!(store.load_branches(&db()).unwrap(), before);
    }
}
