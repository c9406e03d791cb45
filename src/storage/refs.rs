//! Branch records and the per-database branch registry.
//!
//! A branch is a named pointer at a commit head plus a cached count of the
//! commits on its first-parent history. This module handles:
//! - the registry value stored for each database, including which branch is
//!   its default
//! - head preconditions for compare-and-set updates
//!
//! Persisting the registry is the job of a
//! [`MetadataStore`](crate::storage::persistence::MetadataStore); every
//! backend funnels its conditional updates through
//! [`BranchRegistry::update_branch_if`] so they agree on what a conflict is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId, DatabaseId};

/// A named pointer at a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// current head commit
    #[serde(rename = "commit")]
    pub head: CommitId,
    /// number of commits on the first-parent history of `head`
    pub commit_count: u64,
    #[serde(default)]
    pub description: String,
}

impl Branch {
    pub fn new(head: CommitId, commit_count: u64) -> Self {
        Self {
            head,
            commit_count,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// the same branch moved to `head` with `added` more commits
    pub fn advanced(&self, head: CommitId, added: u64) -> Self {
        Self {
            head,
            commit_count: self.commit_count + added,
            description: self.description.clone(),
        }
    }
}

/// What a branch must look like for a conditional update to go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPrecondition {
    /// the branch must not exist yet
    Absent,
    /// the branch must currently point at this commit
    Head(CommitId),
}

impl HeadPrecondition {
    /// check the precondition against the branch's current record
    pub fn holds(&self, current: Option<&Branch>) -> bool {
        match (self, current) {
            (HeadPrecondition::Absent, None) => true,
            (HeadPrecondition::Head(expected), Some(branch)) => branch.head == *expected,
            _ => false,
        }
    }
}

/// All branches of one database, keyed by name, plus its default branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_branch: Option<BranchName>,
    #[serde(default)]
    branches: BTreeMap<BranchName, Branch>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// the stored default branch, if one was recorded
    pub fn default_branch(&self) -> Option<&BranchName> {
        self.default_branch.as_ref()
    }

    /// record `name` as the default branch
    ///
    /// Returns false and changes nothing when there is no such branch.
    pub fn set_default_branch(&mut self, name: BranchName) -> bool {
        if !self.branches.contains_key(&name) {
            return false;
        }
        self.default_branch = Some(name);
        true
    }

    pub fn get(&self, name: &BranchName) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn contains(&self, name: &BranchName) -> bool {
        self.branches.contains_key(name)
    }

    /// insert or replace a branch, returning the previous record
    pub fn insert(&mut self, name: BranchName, branch: Branch) -> Option<Branch> {
        self.branches.insert(name, branch)
    }

    /// remove a branch; removing the default branch also clears the default
    pub fn remove(&mut self, name: &BranchName) -> Option<Branch> {
        if self.default_branch.as_ref() == Some(name) {
            self.default_branch = None;
        }
        self.branches.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BranchName, &Branch)> + '_ {
        self.branches.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &BranchName> + '_ {
        self.branches.keys()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Replace one branch only if it still matches `precondition`.
    ///
    /// Other branches are left alone. Returns
    /// [`StorageError::ConcurrentModification`] when the check fails.
    pub fn update_branch_if(
        &mut self,
        db: &DatabaseId,
        name: &BranchName,
        precondition: &HeadPrecondition,
        branch: Branch,
    ) -> StorageResult<()> {
        if !precondition.holds(self.branches.get(name)) {
            return Err(StorageError::ConcurrentModification {
                database: db.to_string(),
                branch: name.clone(),
            });
        }
        self.branches.insert(name.clone(), branch);
        Ok(())
    }

    /// Remove one branch only if it still matches `precondition`.
    pub fn remove_branch_if(
        &mut self,
        db: &DatabaseId,
        name: &BranchName,
        precondition: &HeadPrecondition,
    ) -> StorageResult<Branch> {
        if *precondition == HeadPrecondition::Absent || !precondition.holds(self.branches.get(name)) {
            return Err(StorageError::ConcurrentModification {
                database: db.to_string(),
                branch: name.clone(),
            });
        }
        self.remove(name).ok_or_else(|| StorageError::Internal(format!("branch {} vanished", name)))
    }
}
