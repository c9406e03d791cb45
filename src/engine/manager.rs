//! Engine - coordinates all commit and branch operations.
//!
//! The Engine is the main entry point for the version-control core.
//! It handles:
//! - Creating databases and recording uploads as commits
//! - Creating, rewinding, describing and deleting branches
//! - Choosing each database's default branch
//! - Fast-forward merges (see `merge.rs`)
//!
//! Every branch move is a compare-and-set in the metadata store; the engine
//! itself holds no locks and keeps no per-database state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};
use ulid::Ulid;

use crate::engine::clock::{Clock, SystemClock};
use crate::engine::config::{ConfigError, ConfigViolation, EngineConfig};
use crate::engine::error::{EngineError, EngineResult, Missing};
use crate::engine::identity::{IdentityResolver, StaticIdentityResolver};
use crate::storage::{
    Branch, BranchName, BranchRegistry, Commit, CommitBuilder, CommitId, CommitSet, ContentStore, DatabaseId,
    Entry, GitBackend, HeadPrecondition, MetadataStore, Signature, StorageError, StorageResult, Tree,
};

/// One file of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub last_modified: DateTime<Utc>,
}

/// Who a new commit is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorSpec {
    /// look the user up through the identity resolver
    User(String),
    /// use this name and email as given
    Explicit(Signature),
}

/// An upload to record as a commit.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub files: Vec<SnapshotFile>,
    pub author: AuthorSpec,
    /// empty means "use the configured default"
    pub message: String,
    /// defaults to the engine clock
    pub timestamp: Option<DateTime<Utc>>,
    /// when set, the branch must still point here
    pub expected_head: Option<CommitId>,
}

impl NewCommit {
    pub fn new(author: AuthorSpec) -> Self {
        Self {
            files: Vec::new(),
            author,
            message: String::new(),
            timestamp: None,
            expected_head: None,
        }
    }

    /// add a file to the snapshot
    pub fn file(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>, last_modified: DateTime<Utc>) -> Self {
        self.files.push(SnapshotFile {
            name: name.into(),
            bytes: bytes.into(),
            last_modified,
        });
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn expected_head(mut self, head: CommitId) -> Self {
        self.expected_head = Some(head);
        self
    }
}

/// The version-control engine.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    content: Arc<dyn ContentStore>,
    metadata: Arc<dyn MetadataStore>,
    identities: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
}

/// Collects the engine's collaborators.
///
/// Both stores are required. Without a resolver every `AuthorSpec::User`
/// lookup fails; without a clock the system clock is used.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    content: Option<Arc<dyn ContentStore>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    identities: Option<Arc<dyn IdentityResolver>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn content_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.content = Some(store);
        self
    }

    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    /// use one git repository for both content and metadata
    pub fn git_backend(self, backend: GitBackend) -> Self {
        let shared = Arc::new(backend);
        self.content_store(shared.clone()).metadata_store(shared)
    }

    pub fn identity_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identities = Some(resolver);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> EngineResult<Engine> {
        let mut violations = match self.config.validate() {
            Ok(()) => Vec::new(),
            Err(e) => e.violations,
        };
        if self.content.is_none() {
            violations.push(ConfigViolation::new("content_store", "is required"));
        }
        if self.metadata.is_none() {
            violations.push(ConfigViolation::new("metadata_store", "is required"));
        }

        match (self.content, self.metadata) {
            (Some(content), Some(metadata)) if violations.is_empty() => Ok(Engine {
                inner: Arc::new(EngineInner {
                    config: self.config,
                    content,
                    metadata,
                    identities: self
                        .identities
                        .unwrap_or_else(|| Arc::new(StaticIdentityResolver::new())),
                    clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                }),
            }),
            _ => Err(ConfigError { violations }.into()),
        }
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn content_store(&self) -> &dyn ContentStore {
        self.inner.content.as_ref()
    }

    pub fn metadata_store(&self) -> &dyn MetadataStore {
        self.inner.metadata.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ==================== Reads ====================

    /// All branches of a database.
    pub fn branches(&self, db: &DatabaseId) -> EngineResult<BranchRegistry> {
        Ok(self.inner.metadata.load_branches(db)?)
    }

    /// All commits of a database.
    pub fn commits(&self, db: &DatabaseId) -> EngineResult<CommitSet> {
        Ok(self.inner.metadata.load_commits(db)?)
    }

    /// One branch.
    pub fn branch(&self, db: &DatabaseId, name: &BranchName) -> EngineResult<Branch> {
        self.branches(db)?
            .get(name)
            .cloned()
            .ok_or_else(|| branch_not_found(db, name))
    }

    /// The branch a database opens on.
    ///
    /// A database stored without a recorded default falls back to the
    /// configured default branch if it has one, else to its first branch.
    pub fn default_branch(&self, db: &DatabaseId) -> EngineResult<BranchName> {
        self.effective_default(db, &self.branches(db)?)
    }

    /// Commits on a branch's first-parent history, newest first.
    pub fn history(&self, db: &DatabaseId, name: &BranchName) -> EngineResult<Vec<Commit>> {
        let branch = self.branch(db, name)?;
        let commits = self.commits(db)?;
        let history = commits
            .first_parent_history(branch.head)
            .map(|c| c.cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(history)
    }

    /// Commits on a branch's first-parent history that come after `since`,
    /// newest first. Walks to the root if `since` isn't on that history.
    pub fn commits_since(&self, db: &DatabaseId, name: &BranchName, since: CommitId) -> EngineResult<Vec<Commit>> {
        let branch = self.branch(db, name)?;
        let commits = self.commits(db)?;
        let mut newer = Vec::new();
        for commit in commits.first_parent_history(branch.head) {
            let commit = commit?;
            if commit.id == since {
                break;
            }
            newer.push(commit.clone());
        }
        Ok(newer)
    }

    /// Check if a commit is on a branch's first-parent history.
    pub fn is_commit_in_branch_history(&self, db: &DatabaseId, name: &BranchName, id: CommitId) -> EngineResult<bool> {
        let branch = self.branch(db, name)?;
        Ok(self.commits(db)?.contains_in_history(branch.head, id)?)
    }

    /// The bytes of one file as of a commit.
    pub fn read_entry(&self, db: &DatabaseId, commit: CommitId, name: &str) -> EngineResult<Vec<u8>> {
        let commits = self.commits(db)?;
        let found = commits
            .get(&commit)
            .ok_or(EngineError::NotFound(Missing::Commit(commit)))?;
        let entry = found.tree.get(name).ok_or_else(|| {
            EngineError::NotFound(Missing::Entry {
                commit,
                name: name.to_string(),
            })
        })?;
        Ok(self.inner.content.get(&entry.content_digest)?)
    }

    // ==================== Writes ====================

    /// Record the first upload of a database on the default branch.
    pub fn create_database(&self, db: &DatabaseId, upload: NewCommit) -> EngineResult<CommitId> {
        let _span = info_span!("create_database", operation_id = %Ulid::new(), database = %db).entered();

        if !self.branches(db)?.is_empty() {
            return Err(EngineError::DatabaseExists { database: db.to_string() });
        }

        let default_message = self.inner.config.default_initial_message.clone();
        let commit = self.build_upload(&upload, None, &default_message)?;
        let id = commit.id;
        self.inner.metadata.store_commits(db, &CommitSet::from_iter([commit]))?;

        // the first branch and the default are recorded together
        let name = &self.inner.config.default_branch;
        self.modify_registry(db, name, id, |registry| {
            if !registry.is_empty() {
                return Err(stale(db, name));
            }
            registry.insert(name.clone(), Branch::new(id, 1));
            registry.set_default_branch(name.clone());
            Ok(())
        })
        .map_err(|e| match e {
            EngineError::Conflict { .. } => EngineError::DatabaseExists { database: db.to_string() },
            other => other,
        })?;

        info!(branch = %name, commit = %id.short(), "created database");
        Ok(id)
    }

    /// Record an upload on top of a branch.
    pub fn commit(&self, db: &DatabaseId, name: &BranchName, upload: NewCommit) -> EngineResult<CommitId> {
        let _span =
            info_span!("commit", operation_id = %Ulid::new(), database = %db, branch = %name).entered();

        let current = self.branch(db, name)?;
        let default_message = self.inner.config.default_commit_message.clone();
        let commit = self.build_upload(&upload, Some(current.head), &default_message)?;
        let id = commit.id;

        if let Some(expected) = upload.expected_head {
            if expected != current.head {
                warn!(expected = %expected.short(), actual = %current.head.short(), "branch moved before commit");
                return Err(EngineError::Conflict {
                    database: db.to_string(),
                    branch: name.clone(),
                    attempted: id,
                });
            }
        }

        self.inner.metadata.store_commits(db, &CommitSet::from_iter([commit]))?;
        self.advance_branch(db, name, HeadPrecondition::Head(current.head), current.advanced(id, 1))?;

        info!(commit = %id.short(), parent = %current.head.short(), "committed upload");
        Ok(id)
    }

    /// Create a branch pointing at an existing commit.
    pub fn create_branch(
        &self,
        db: &DatabaseId,
        name: &BranchName,
        from: CommitId,
        description: &str,
    ) -> EngineResult<Branch> {
        let _span =
            info_span!("create_branch", operation_id = %Ulid::new(), database = %db, branch = %name).entered();

        if self.branches(db)?.contains(name) {
            return Err(branch_exists(db, name));
        }
        let commits = self.commits(db)?;
        if !commits.contains(&from) {
            return Err(EngineError::NotFound(Missing::Commit(from)));
        }

        let branch = Branch::new(from, commits.count_first_parent(from)?).with_description(description);
        self.advance_branch(db, name, HeadPrecondition::Absent, branch.clone())
            .map_err(|e| match e {
                EngineError::Conflict { .. } => branch_exists(db, name),
                other => other,
            })?;

        info!(commit = %from.short(), commit_count = branch.commit_count, "created branch");
        Ok(branch)
    }

    /// Move a branch back to a commit on its own first-parent history.
    ///
    /// The commits after it stay in the commit set.
    pub fn reset_branch(&self, db: &DatabaseId, name: &BranchName, to: CommitId) -> EngineResult<Branch> {
        let _span =
            info_span!("reset_branch", operation_id = %Ulid::new(), database = %db, branch = %name).entered();

        let current = self.branch(db, name)?;
        let commits = self.commits(db)?;
        if !commits.contains_in_history(current.head, to)? {
            return Err(EngineError::invalid_input(format!(
                "commit {} is not in the history of branch '{}'",
                to.short(),
                name
            )));
        }

        let branch = Branch {
            head: to,
            commit_count: commits.count_first_parent(to)?,
            description: current.description.clone(),
        };
        self.advance_branch(db, name, HeadPrecondition::Head(current.head), branch.clone())?;

        info!(from = %current.head.short(), to = %to.short(), "reset branch");
        Ok(branch)
    }

    /// Make `name` the default branch of a database.
    pub fn set_default_branch(&self, db: &DatabaseId, name: &BranchName) -> EngineResult<()> {
        let _span =
            info_span!("set_default_branch", operation_id = %Ulid::new(), database = %db, branch = %name).entered();

        let current = self.branch(db, name)?;
        self.modify_registry(db, name, current.head, |registry| {
            if registry.set_default_branch(name.clone()) {
                Ok(())
            } else {
                Err(stale(db, name))
            }
        })?;

        info!("set default branch");
        Ok(())
    }

    /// Replace a branch's description.
    pub fn update_branch_description(
        &self,
        db: &DatabaseId,
        name: &BranchName,
        description: &str,
    ) -> EngineResult<Branch> {
        let _span = info_span!(
            "update_branch_description",
            operation_id = %Ulid::new(),
            database = %db,
            branch = %name
        )
        .entered();

        let current = self.branch(db, name)?;
        let mut updated = None;
        self.modify_registry(db, name, current.head, |registry| {
            let branch = registry
                .get(name)
                .cloned()
                .ok_or_else(|| stale(db, name))?
                .with_description(description);
            registry.insert(name.clone(), branch.clone());
            updated = Some(branch);
            Ok(())
        })?;

        info!("updated branch description");
        updated.ok_or_else(|| branch_not_found(db, name))
    }

    /// Delete a branch, returning what it pointed at.
    ///
    /// The default branch can't be deleted. The branch's commits stay in the
    /// commit set.
    pub fn delete_branch(&self, db: &DatabaseId, name: &BranchName) -> EngineResult<Branch> {
        let _span =
            info_span!("delete_branch", operation_id = %Ulid::new(), database = %db, branch = %name).entered();

        let branches = self.branches(db)?;
        let current = branches.get(name).cloned().ok_or_else(|| branch_not_found(db, name))?;
        if self.effective_default(db, &branches)? == *name {
            return Err(EngineError::invalid_input(format!(
                "branch '{}' is the default branch of {}; make another branch the default first",
                name, db
            )));
        }

        let seen_default = branches.default_branch().cloned();
        let precondition = HeadPrecondition::Head(current.head);
        self.modify_registry(db, name, current.head, |registry| {
            if registry.default_branch() != seen_default.as_ref() {
                return Err(stale(db, name));
            }
            registry.remove_branch_if(db, name, &precondition).map(|_| ())
        })?;

        info!(head = %current.head.short(), "deleted branch");
        Ok(current)
    }

    // ==================== Helpers ====================

    /// Compare-and-set one branch, turning a lost race into `Conflict`.
    pub(crate) fn advance_branch(
        &self,
        db: &DatabaseId,
        name: &BranchName,
        precondition: HeadPrecondition,
        branch: Branch,
    ) -> EngineResult<()> {
        let attempted = branch.head;
        self.inner
            .metadata
            .update_branch(db, name, &precondition, branch)
            .map_err(|e| lost_race(db, name, attempted, e))
    }

    /// Read-modify-write the registry on behalf of one branch.
    fn modify_registry<F>(
        &self,
        db: &DatabaseId,
        name: &BranchName,
        attempted: CommitId,
        mut change: F,
    ) -> EngineResult<()>
    where
        F: FnMut(&mut BranchRegistry) -> StorageResult<()>,
    {
        self.inner
            .metadata
            .modify_branches(db, &mut change)
            .map_err(|e| lost_race(db, name, attempted, e))
    }

    fn effective_default(&self, db: &DatabaseId, registry: &BranchRegistry) -> EngineResult<BranchName> {
        if let Some(name) = registry.default_branch() {
            return Ok(name.clone());
        }
        let configured = &self.inner.config.default_branch;
        if registry.contains(configured) {
            return Ok(configured.clone());
        }
        registry
            .names()
            .next()
            .cloned()
            .ok_or_else(|| EngineError::NotFound(Missing::Database(db.to_string())))
    }

    pub(crate) fn resolve_author(&self, author: &AuthorSpec) -> EngineResult<Signature> {
        let signature = match author {
            AuthorSpec::User(username) => {
                let identity = self
                    .inner
                    .identities
                    .resolve(username)?
                    .ok_or_else(|| EngineError::NotFound(Missing::User(username.clone())))?;
                if !identity.is_complete() {
                    return Err(EngineError::invalid_input(format!(
                        "user '{}' needs a display name and email address before committing",
                        username
                    )));
                }
                identity.signature()
            }
            AuthorSpec::Explicit(signature) => signature.clone(),
        };
        if signature.name.trim().is_empty() || signature.email.trim().is_empty() {
            return Err(EngineError::invalid_input("commit author needs a name and email address"));
        }
        Ok(signature)
    }

    /// store the files of an upload and build its commit
    fn build_upload(&self, upload: &NewCommit, parent: Option<CommitId>, default_message: &str) -> EngineResult<Commit> {
        if upload.files.is_empty() {
            return Err(EngineError::invalid_input("an upload needs at least one file"));
        }
        let author = self.resolve_author(&upload.author)?;

        let entries = upload
            .files
            .iter()
            .map(|f| Entry::store(self.inner.content.as_ref(), f.name.clone(), &f.bytes, f.last_modified))
            .collect::<Result<Vec<_>, _>>()?;
        let tree = Tree::new(entries)?;
        debug!(files = tree.len(), size = tree.total_size(), "stored upload");

        let message = if upload.message.trim().is_empty() {
            default_message.to_string()
        } else {
            upload.message.clone()
        };

        let mut builder = CommitBuilder::new()
            .tree(tree)
            .author(author)
            .message(message)
            .timestamp(upload.timestamp.unwrap_or_else(|| self.now()));
        if let Some(parent) = parent {
            builder = builder.parent(parent);
        }
        Ok(builder.build()?)
    }
}

fn branch_not_found(db: &DatabaseId, name: &BranchName) -> EngineError {
    EngineError::BranchNotFound {
        database: db.to_string(),
        branch: name.clone(),
    }
}

/// the registry no longer matches what the operation read
fn stale(db: &DatabaseId, name: &BranchName) -> StorageError {
    StorageError::ConcurrentModification {
        database: db.to_string(),
        branch: name.clone(),
    }
}

fn lost_race(db: &DatabaseId, name: &BranchName, attempted: CommitId, err: StorageError) -> EngineError {
    if !err.is_conflict() {
        return err.into();
    }
    warn!(branch = %name, commit = %attempted.short(), "lost branch update race");
    EngineError::Conflict {
        database: db.to_string(),
        branch: name.clone(),
        attempted,
    }
}

fn branch_exists(db: &DatabaseId, name: &BranchName) -> EngineError {
    EngineError::BranchExists {
        database: db.to_string(),
        branch: name.clone(),
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{alice_upload, at, db, setup, TestEngine};
    use crate::storage::MemoryContentStore;

    fn with_database() -> (TestEngine, CommitId) {
        let t = setup();
        let root = t.engine.create_database(&db(), alice_upload(b"v1")).unwrap();
        (t, root)
    }

    #[test]
    fn test_builder_requires_stores() {
        let result = Engine::builder().build();
        match result {
            Err(EngineError::Config(e)) => {
                let fields: Vec<&str> = e.violations.iter().map(|v| v.field.as_str()).collect();
                assert_eq!(fields, vec!["content_store", "metadata_store"]);
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_builder_reports_config_and_stores_together() {
        let result = Engine::builder()
            .config(EngineConfig::new().max_merge_attempts(0))
            .content_store(Arc::new(MemoryContentStore::new()))
            .build();
        match result {
            Err(EngineError::Config(e)) => assert_eq!(e.violations.len(), 2),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_engine_is_send_sync_clone() {
        fn assert_traits<T: Send + Sync + Clone>() {}
        assert_traits::<Engine>();
    }

    #[test]
    fn test_create_database() {
        let (t, root) = with_database();

        let branch = t.engine.branch(&db(), &BranchName::main()).unwrap();
        assert_eq!(branch.head, root);
        assert_eq!(branch.commit_count, 1);
        assert!(branch.description.is_empty());

        let commits = t.engine.commits(&db()).unwrap();
        let commit = commits.get(&root).unwrap();
        assert!(commit.is_root());
        assert_eq!(commit.message, "Initial upload.");
        assert_eq!(commit.author_name, "Alice Smith");
        assert_eq!(commit.timestamp, at(0));
        assert_eq!(t.content.writes(), 1);
    }

    #[test]
    fn test_create_database_twice_fails() {
        let (t, _) = with_database();
        let result = t.engine.create_database(&db(), alice_upload(b"v1"));
        assert!(matches!(result, Err(EngineError::DatabaseExists { .. })));
    }

    #[test]
    fn test_create_database_uses_configured_branch() {
        let t = crate::engine::testing::setup_with(EngineConfig::new().default_branch(BranchName::new("trunk").unwrap()));
        t.engine.create_database(&db(), alice_upload(b"v1")).unwrap();
        let names: Vec<String> = t.engine.branches(&db()).unwrap().names().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["trunk"]);
    }

    #[test]
    fn test_upload_validation() {
        let t = setup();
        let empty = NewCommit::new(AuthorSpec::User("alice".to_string()));
        assert!(matches!(t.engine.create_database(&db(), empty), Err(EngineError::InvalidInput { .. })));

        let unknown = NewCommit::new(AuthorSpec::User("mallory".to_string())).file("a", b"x".to_vec(), at(0));
        assert!(matches!(
            t.engine.create_database(&db(), unknown),
            Err(EngineError::NotFound(Missing::User(_)))
        ));

        let incomplete = NewCommit::new(AuthorSpec::User("carol".to_string())).file("a", b"x".to_vec(), at(0));
        assert!(matches!(
            t.engine.create_database(&db(), incomplete),
            Err(EngineError::InvalidInput { .. })
        ));

        let duplicate = alice_upload(b"x").file("stats.sqlite", b"y".to_vec(), at(0));
        assert!(matches!(
            t.engine.create_database(&db(), duplicate),
            Err(EngineError::InvalidInput { .. })
        ));

        // nothing was created along the way
        assert!(t.engine.branches(&db()).unwrap().is_empty());
    }

    #[test]
    fn test_commit_advances_branch() {
        let (t, root) = with_database();
        t.clock.advance(chrono::Duration::seconds(60));

        let explicit = NewCommit::new(AuthorSpec::Explicit(Signature::new("CI Bot", "ci@example.com")))
            .file("stats.sqlite", b"v2".to_vec(), at(30))
            .message("nightly refresh");
        let second = t.engine.commit(&db(), &BranchName::main(), explicit).unwrap();

        let branch = t.engine.branch(&db(), &BranchName::main()).unwrap();
        assert_eq!(branch.head, second);
        assert_eq!(branch.commit_count, 2);

        let commits = t.engine.commits(&db()).unwrap();
        let commit = commits.get(&second).unwrap();
        assert_eq!(commit.parent, Some(root));
        assert_eq!(commit.author_name, "CI Bot");
        assert_eq!(commit.message, "nightly refresh");
        assert_eq!(commit.timestamp, at(60));
        assert!(commits.verify_acyclic().is_ok());
    }

    #[test]
    fn test_commit_default_message_and_dedup() {
        let (t, _) = with_database();
        let id = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v1")).unwrap();

        let commits = t.engine.commits(&db()).unwrap();
        assert_eq!(commits.get(&id).unwrap().message, "New upload.");
        // identical bytes were only stored once
        assert_eq!(t.content.writes(), 1);
    }

    #[test]
    fn test_commit_expected_head() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();

        let stale = alice_upload(b"v3").expected_head(root);
        let result = t.engine.commit(&db(), &BranchName::main(), stale);
        assert!(matches!(result, Err(EngineError::Conflict { .. })));
        assert_eq!(t.engine.branch(&db(), &BranchName::main()).unwrap().head, second);

        let fresh = alice_upload(b"v3").expected_head(second);
        assert!(t.engine.commit(&db(), &BranchName::main(), fresh).is_ok());
    }

    #[test]
    fn test_commit_to_missing_branch() {
        let (t, _) = with_database();
        let result = t.engine.commit(&db(), &BranchName::new("nope").unwrap(), alice_upload(b"v2"));
        assert!(matches!(result, Err(EngineError::BranchNotFound { .. })));
    }

    #[test]
    fn test_commit_lost_race_is_conflict() {
        let (t, root) = with_database();
        t.metadata.lose_next_branch_race();

        let result = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2"));
        assert!(matches!(result, Err(ref e) if e.is_retryable()));
        assert_eq!(t.engine.branch(&db(), &BranchName::main()).unwrap().head, root);
    }

    #[test]
    fn test_create_branch() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();
        let dev = BranchName::new("dev").unwrap();

        let branch = t.engine.create_branch(&db(), &dev, second, "experiments").unwrap();
        assert_eq!(branch.head, second);
        assert_eq!(branch.commit_count, 2);
        assert_eq!(branch.description, "experiments");

        let again = t.engine.create_branch(&db(), &dev, root, "");
        assert!(matches!(again, Err(EngineError::BranchExists { .. })));

        let missing = t
            .engine
            .create_branch(&db(), &BranchName::new("other").unwrap(), CommitId::from_bytes([9; 32]), "");
        assert!(matches!(missing, Err(EngineError::NotFound(Missing::Commit(_)))));
    }

    #[test]
    fn test_default_branch() {
        let (t, root) = with_database();
        let dev = BranchName::new("dev").unwrap();
        assert_eq!(t.engine.default_branch(&db()).unwrap(), BranchName::main());
        assert_eq!(t.engine.branches(&db()).unwrap().default_branch(), Some(&BranchName::main()));

        t.engine.create_branch(&db(), &dev, root, "").unwrap();
        t.engine.set_default_branch(&db(), &dev).unwrap();
        assert_eq!(t.engine.default_branch(&db()).unwrap(), dev);

        let missing = t.engine.set_default_branch(&db(), &BranchName::new("nope").unwrap());
        assert!(matches!(missing, Err(EngineError::BranchNotFound { .. })));
        assert_eq!(t.engine.default_branch(&db()).unwrap(), dev);

        let unknown = DatabaseId::new("bob", "stats.sqlite").unwrap();
        assert!(matches!(
            t.engine.default_branch(&unknown),
            Err(EngineError::NotFound(Missing::Database(_)))
        ));
    }

    #[test]
    fn test_default_branch_without_stored_default() {
        let t = setup();
        let head = CommitId::from_bytes([1; 32]);
        let dev = BranchName::new("dev").unwrap();

        let mut registry = BranchRegistry::new();
        registry.insert(dev.clone(), Branch::new(head, 1));
        t.metadata.store_branches(&db(), &registry).unwrap();
        assert_eq!(t.engine.default_branch(&db()).unwrap(), dev);

        registry.insert(BranchName::main(), Branch::new(head, 1));
        t.metadata.store_branches(&db(), &registry).unwrap();
        assert_eq!(t.engine.default_branch(&db()).unwrap(), BranchName::main());
    }

    #[test]
    fn test_delete_branch() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();
        let dev = BranchName::new("dev").unwrap();
        t.engine.create_branch(&db(), &dev, second, "experiments").unwrap();

        let removed = t.engine.delete_branch(&db(), &dev).unwrap();
        assert_eq!(removed.head, second);
        assert_eq!(removed.description, "experiments");
        assert!(!t.engine.branches(&db()).unwrap().contains(&dev));
        assert!(t.engine.commits(&db()).unwrap().contains(&second));

        let again = t.engine.delete_branch(&db(), &dev);
        assert!(matches!(again, Err(EngineError::BranchNotFound { .. })));

        let default = t.engine.delete_branch(&db(), &BranchName::main());
        assert!(matches!(default, Err(EngineError::InvalidInput { .. })));
        assert!(t.engine.branches(&db()).unwrap().contains(&BranchName::main()));

        // once another branch is the default, the old one can go
        t.engine.create_branch(&db(), &dev, root, "").unwrap();
        t.engine.set_default_branch(&db(), &dev).unwrap();
        t.engine.delete_branch(&db(), &BranchName::main()).unwrap();
        let names: Vec<BranchName> = t.engine.branches(&db()).unwrap().names().cloned().collect();
        assert_eq!(names, vec![dev]);
    }

    #[test]
    fn test_delete_branch_lost_race() {
        let (t, root) = with_database();
        let dev = BranchName::new("dev").unwrap();
        t.engine.create_branch(&db(), &dev, root, "").unwrap();

        t.metadata.lose_next_branch_race();
        let result = t.engine.delete_branch(&db(), &dev);
        assert!(matches!(result, Err(ref e) if e.is_retryable()));
        assert!(t.engine.branches(&db()).unwrap().contains(&dev));
    }

    #[test]
    fn test_update_branch_description() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();

        let branch = t
            .engine
            .update_branch_description(&db(), &BranchName::main(), "Production data")
            .unwrap();
        assert_eq!(branch.description, "Production data");
        assert_eq!(branch.head, second);
        assert_eq!(branch.commit_count, 2);
        assert_eq!(t.engine.branch(&db(), &BranchName::main()).unwrap(), branch);

        // moving the branch keeps the description
        t.engine.reset_branch(&db(), &BranchName::main(), root).unwrap();
        assert_eq!(
            t.engine.branch(&db(), &BranchName::main()).unwrap().description,
            "Production data"
        );

        let missing = t
            .engine
            .update_branch_description(&db(), &BranchName::new("nope").unwrap(), "x");
        assert!(matches!(missing, Err(EngineError::BranchNotFound { .. })));
    }

    #[test]
    fn test_history_and_membership() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();
        let third = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v3")).unwrap();

        let ids: Vec<CommitId> = t
            .engine
            .history(&db(), &BranchName::main())
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![third, second, root]);

        let since: Vec<CommitId> = t
            .engine
            .commits_since(&db(), &BranchName::main(), root)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(since, vec![third, second]);

        assert!(t.engine.is_commit_in_branch_history(&db(), &BranchName::main(), root).unwrap());
        assert!(!t
            .engine
            .is_commit_in_branch_history(&db(), &BranchName::main(), CommitId::from_bytes([1; 32]))
            .unwrap());
    }

    #[test]
    fn test_reset_branch() {
        let (t, root) = with_database();
        let second = t.engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();

        let branch = t.engine.reset_branch(&db(), &BranchName::main(), root).unwrap();
        assert_eq!(branch.head, root);
        assert_eq!(branch.commit_count, 1);

        // the rewound commit is still stored
        assert!(t.engine.commits(&db()).unwrap().contains(&second));

        // can't reset forward to a commit outside the branch's history
        let result = t.engine.reset_branch(&db(), &BranchName::main(), second);
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
    }

    #[test]
    fn test_read_entry() {
        let (t, root) = with_database();
        assert_eq!(t.engine.read_entry(&db(), root, "stats.sqlite").unwrap(), b"v1");

        let missing = t.engine.read_entry(&db(), root, "other.sqlite");
        assert!(matches!(missing, Err(EngineError::NotFound(Missing::Entry { .. }))));

        let unknown = t.engine.read_entry(&db(), CommitId::from_bytes([5; 32]), "stats.sqlite");
        assert!(matches!(unknown, Err(EngineError::NotFound(Missing::Commit(_)))));
    }

    #[test]
    fn test_databases_are_independent() {
        let (t, _) = with_database();
        let other = DatabaseId::new("bob", "stats.sqlite").unwrap();
        assert!(t.engine.branches(&other).unwrap().is_empty());
        assert!(matches!(
            t.engine.branch(&other, &BranchName::main()),
            Err(EngineError::BranchNotFound { .. })
        ));
        t.engine.create_database(&other, alice_upload(b"v1")).unwrap();
    }

    #[test]
    fn test_git_backed_engine() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = GitBackend::init(dir.path()).unwrap();
        let engine = Engine::builder()
            .git_backend(backend)
            .identity_resolver(Arc::new(crate::engine::testing::users()))
            .build()
            .unwrap();

        let root = engine.create_database(&db(), alice_upload(b"v1")).unwrap();
        let second = engine.commit(&db(), &BranchName::main(), alice_upload(b"v2")).unwrap();
        assert_eq!(engine.read_entry(&db(), root, "stats.sqlite").unwrap(), b"v1");

        // a fresh handle on the same repository sees everything
        let reopened = Engine::builder()
            .git_backend(GitBackend::open(dir.path()).unwrap())
            .build()
            .unwrap();
        let history = reopened.history(&db(), &BranchName::main()).unwrap();
        assert_eq!(history.iter().map(|c| c.id).collect::<Vec<_>>(), vec![second, root]);
        assert!(reopened.commits(&db()).unwrap().verify_ids().is_ok());
    }

    #[test]
    fn test_git_backed_branch_management() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Engine::builder()
            .git_backend(GitBackend::init(dir.path()).unwrap())
            .identity_resolver(Arc::new(crate::engine::testing::users()))
            .build()
            .unwrap();
        let dev = BranchName::new("dev").unwrap();

        let root = engine.create_database(&db(), alice_upload(b"v1")).unwrap();
        engine.create_branch(&db(), &dev, root, "").unwrap();
        engine.set_default_branch(&db(), &dev).unwrap();
        engine.update_branch_description(&db(), &dev, "Staging").unwrap();
        engine.delete_branch(&db(), &BranchName::main()).unwrap();

        let reopened = Engine::builder()
            .git_backend(GitBackend::open(dir.path()).unwrap())
            .build()
            .unwrap();
        assert_eq!(reopened.default_branch(&db()).unwrap(), dev);
        let branches = reopened.branches(&db()).unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches.get(&dev).unwrap().description, "Staging");
    }
}
