//! commit creation and history traversal
//!
//! commits are the immutable units of history. For each hosted database:
//! - every upload creates a commit pointing at a tree of stored files
//! - a commit's id is the SHA-256 of its canonical serialization, so equal
//!   inputs always give equal ids
//! - merge commits carry the merged-in head as an extra parent
//!
//! this module handles commit construction, id computation, and walking the
//! per-database commit set

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::{write_length_prefixed, Tree};
use crate::storage::types::{format_timestamp, is_whole_seconds, sha256, truncate_to_seconds, CommitId, Signature};

/// one node of a database's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommitRecord", into = "CommitRecord")]
pub struct Commit {
    pub id: CommitId,
    pub tree: Tree,
    /// first parent; `None` only for a root commit
    pub parent: Option<CommitId>,
    /// additional parents, set on merge commits
    pub other_parents: Vec<CommitId>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    /// whole seconds only; the id can't tell finer values apart
    pub timestamp: DateTime<Utc>,
}

/// on-disk form of a commit
#[derive(Serialize, Deserialize)]
struct CommitRecord {
    id: CommitId,
    tree: Tree,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<CommitId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    other_parents: Vec<CommitId>,
    author_name: String,
    author_email: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<CommitRecord> for Commit {
    type Error = String;

    fn try_from(record: CommitRecord) -> Result<Self, Self::Error> {
        if !is_whole_seconds(&record.timestamp) {
            return Err(format!("timestamp of commit {} has a sub-second part", record.id));
        }
        Ok(Commit {
            id: record.id,
            tree: record.tree,
            parent: record.parent,
            other_parents: record.other_parents,
            author_name: record.author_name,
            author_email: record.author_email,
            message: record.message,
            timestamp: record.timestamp,
        })
    }
}

impl From<Commit> for CommitRecord {
    fn from(commit: Commit) -> Self {
        CommitRecord {
            id: commit.id,
            tree: commit.tree,
            parent: commit.parent,
            other_parents: commit.other_parents,
            author_name: commit.author_name,
            author_email: commit.author_email,
            message: commit.message,
            timestamp: commit.timestamp,
        }
    }
}

impl Commit {
    /// check if this is a merge commit (has multiple parents)
    pub fn is_merge(&self) -> bool {
        !self.other_parents.is_empty()
    }

    /// check if this is a root commit
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// all parents, first parent first
    pub fn parent_ids(&self) -> impl Iterator<Item = &CommitId> + '_ {
        self.parent.iter().chain(self.other_parents.iter())
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }

    /// canonical byte form hashed into the commit id (the `id` field is not
    /// part of it)
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.tree.encode(&mut buf);

        buf.extend_from_slice(b"parent ");
        if let Some(parent) = &self.parent {
            buf.extend_from_slice(parent.to_hex().as_bytes());
        }
        buf.push(b'\n');

        for other in &self.other_parents {
            buf.extend_from_slice(b"other-parent ");
            buf.extend_from_slice(other.to_hex().as_bytes());
            buf.push(b'\n');
        }

        for (label, value) in [
            ("author-name ", &self.author_name),
            ("author-email ", &self.author_email),
            ("message ", &self.message),
        ] {
            buf.extend_from_slice(label.as_bytes());
            write_length_prefixed(&mut buf, value);
            buf.push(b'\n');
        }

        buf.extend_from_slice(b"timestamp ");
        buf.extend_from_slice(format_timestamp(&self.timestamp).as_bytes());
        buf.push(b'\n');
        buf
    }

    /// Recompute the id and compare it with the stored one.
    ///
    /// Sub-second timestamps are rejected too: the canonical form drops
    /// them, so two records differing only there would share an id.
    pub fn verify_id(&self) -> StorageResult<()> {
        if !is_whole_seconds(&self.timestamp) {
            return Err(StorageError::CorruptedHistory {
                commit: self.id,
                reason: "timestamp has a sub-second part".to_string(),
            });
        }
        if let Some(entry) = self.tree.entries().iter().find(|e| !is_whole_seconds(&e.last_modified)) {
            return Err(StorageError::CorruptedHistory {
                commit: self.id,
                reason: format!("last_modified of entry '{}' has a sub-second part", entry.name),
            });
        }
        let computed = create_commit_id(self);
        if computed != self.id {
            return Err(StorageError::CorruptedHistory {
                commit: self.id,
                reason: format!("contents hash to {}", computed),
            });
        }
        Ok(())
    }
}

/// compute a commit's id from every field except `id` itself
pub fn create_commit_id(commit: &Commit) -> CommitId {
    CommitId::from_bytes(sha256(&commit.canonical_bytes()))
}

/// builder for creating commits with a fluent interface
#[derive(Debug, Clone, Default)]
pub struct CommitBuilder {
    tree: Tree,
    parent: Option<CommitId>,
    other_parents: Vec<CommitId>,
    message: String,
    author: Option<Signature>,
    timestamp: Option<DateTime<Utc>>,
}

impl CommitBuilder {
    /// create a new CommitBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// set the tree for this commit
    pub fn tree(mut self, tree: Tree) -> Self {
        self.tree = tree;
        self
    }

    /// set the first parent
    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// add an extra parent (for merge commits)
    pub fn other_parent(mut self, parent: CommitId) -> Self {
        self.other_parents.push(parent);
        self
    }

    /// set the commit message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// set the author signature
    pub fn author(mut self, author: Signature) -> Self {
        self.author = Some(author);
        self
    }

    /// set the commit time; defaults to now
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// create the commit with its id computed
    pub fn build(self) -> StorageResult<Commit> {
        let author = self
            .author
            .ok_or_else(|| StorageError::Internal("commit requires an author".to_string()))?;

        let mut commit = Commit {
            id: CommitId::from_bytes([0; 32]),
            tree: self.tree,
            parent: self.parent,
            other_parents: self.other_parents,
            author_name: author.name,
            author_email: author.email,
            message: self.message,
            timestamp: truncate_to_seconds(self.timestamp.unwrap_or_else(Utc::now)),
        };
        commit.id = create_commit_id(&commit);
        Ok(commit)
    }
}

/// all commits of one database, keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitSet {
    commits: BTreeMap<CommitId, Commit>,
}

impl CommitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, id: &CommitId) -> Option<&Commit> {
        self.commits.get(id)
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    /// insert a commit; returns false if the id was already present (the
    /// stored commit is kept)
    pub fn insert(&mut self, commit: Commit) -> bool {
        if self.commits.contains_key(&commit.id) {
            return false;
        }
        self.commits.insert(commit.id, commit);
        true
    }

    /// insert every commit, returning how many were new
    pub fn union(&mut self, commits: impl IntoIterator<Item = Commit>) -> usize {
        let mut added = 0;
        for commit in commits {
            if self.insert(commit) {
                added += 1;
            }
        }
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = &Commit> + '_ {
        self.commits.values()
    }

    /// walk `parent` links from `start`, newest first
    pub fn first_parent_history(&self, start: CommitId) -> FirstParentHistory<'_> {
        FirstParentHistory {
            commits: self,
            next: Some(start),
            seen: HashSet::new(),
        }
    }

    /// number of commits on the first-parent walk from `start`
    pub fn count_first_parent(&self, start: CommitId) -> StorageResult<u64> {
        let mut count = 0;
        for commit in self.first_parent_history(start) {
            commit?;
            count += 1;
        }
        Ok(count)
    }

    /// check if `id` is on the first-parent walk from `head`
    pub fn contains_in_history(&self, head: CommitId, id: CommitId) -> StorageResult<bool> {
        for commit in self.first_parent_history(head) {
            if commit?.id == id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// check that every commit is stored under its own, correctly computed id
    pub fn verify_ids(&self) -> StorageResult<()> {
        for (key, commit) in &self.commits {
            if *key != commit.id {
                return Err(StorageError::CorruptedHistory {
                    commit: *key,
                    reason: format!("stored under a different id than its own ({})", commit.id),
                });
            }
            commit.verify_id()?;
        }
        Ok(())
    }

    /// Check that the graph over `parent` and `other_parents` has no cycle.
    ///
    /// Parents that aren't in the set are skipped; a partially imported
    /// history is not a cycle.
    pub fn verify_acyclic(&self) -> StorageResult<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<CommitId, Mark> = HashMap::with_capacity(self.commits.len());

        for root in self.commits.keys() {
            if marks.contains_key(root) {
                continue;
            }
            marks.insert(*root, Mark::InProgress);
            // (commit, index of the next parent to visit)
            let mut stack: Vec<(CommitId, usize)> = vec![(*root, 0)];

            while let Some(&(id, next_parent)) = stack.last() {
                let parent = self
                    .commits
                    .get(&id)
                    .and_then(|c| c.parent_ids().nth(next_parent).copied());

                let Some(parent) = parent else {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                };

                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                match marks.get(&parent) {
                    Some(Mark::InProgress) => {
                        return Err(StorageError::CorruptedHistory {
                            commit: parent,
                            reason: "commit is its own ancestor".to_string(),
                        });
                    }
                    Some(Mark::Done) => {}
                    None if self.commits.contains_key(&parent) => {
                        marks.insert(parent, Mark::InProgress);
                        stack.push((parent, 0));
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }
}

impl FromIterator<Commit> for CommitSet {
    fn from_iter<I: IntoIterator<Item = Commit>>(iter: I) -> Self {
        let mut set = CommitSet::new();
        set.union(iter);
        set
    }
}

/// iterate over a first-parent chain, newest first
///
/// yields an error and stops when a link is missing or revisits a commit
pub struct FirstParentHistory<'a> {
    commits: &'a CommitSet,
    next: Option<CommitId>,
    seen: HashSet<CommitId>,
}

impl<'a> Iterator for FirstParentHistory<'a> {
    type Item = StorageResult<&'a Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        if !self.seen.insert(id) {
            return Some(Err(StorageError::CorruptedHistory {
                commit: id,
                reason: "first-parent chain loops back to this commit".to_string(),
            }));
        }
        match self.commits.get(&id) {
            Some(commit) => {
                self.next = commit.parent;
                Some(Ok(commit))
            }
            None => Some(Err(StorageError::CommitNotFound(id))),
        }
    }
}
