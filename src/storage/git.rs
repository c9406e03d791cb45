//! Git-backed storage.
//!
//! A bare git repository holds everything for any number of databases:
//!
//! ```text
//! refs/content/<2 hex>/<62 hex>                      -> blob (uploaded file bytes)
//! refs/dbvcs/<owner>/<folder>/<name>/commits         -> blob (CommitSet as JSON)
//! refs/dbvcs/<owner>/<folder>/<name>/branches        -> blob (BranchRegistry as JSON)
//! ```
//!
//! Database id components are hex-encoded so any owner or folder string maps
//! to a valid ref name. Components longer than `MAX_HEX_SEGMENT / 2` bytes
//! would make a path segment too long for the filesystem, so those are
//! replaced by `sha256-<hex digest>` instead. Content is keyed by SHA-256
//! through its ref; git's own object id is an implementation detail.
//!
//! Metadata documents are updated with compare-and-set on the ref
//! (`reference_matching`), so two processes sharing a repository can't
//! overwrite each other: the loser re-reads, re-applies its change and tries
//! again.
//!
//! `git2::Repository` can't be shared between threads, so the backend keeps a
//! small pool of open handles and each call borrows one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use git2::{ErrorCode, Oid, Repository};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::storage::commit::CommitSet;
use crate::storage::content::{verify_content, ContentStore};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::persistence::MetadataStore;
use crate::storage::refs::BranchRegistry;
use crate::storage::types::{sha256, ContentDigest, DatabaseId};

/// how often a ref write is retried when its ref keeps moving or is locked
const MAX_REF_ATTEMPTS: usize = 8;

/// longest hex-encoded id component used as a ref segment
const MAX_HEX_SEGMENT: usize = 128;

/// idle repository handles kept for reuse
const MAX_IDLE_HANDLES: usize = 8;

/// A bare git repository used as both content store and metadata store.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct GitBackend {
    inner: Arc<GitBackendInner>,
}

struct GitBackendInner {
    idle: Mutex<Vec<Repository>>,
    path: PathBuf,
}

impl GitBackend {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open_bare(path)?;
        Ok(Self::from_repository(repo, path))
    }

    /// Initialize a new bare repository.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init_bare(path)?;
        debug!(path = %path.display(), "initialized storage repository");
        Ok(Self::from_repository(repo, path))
    }

    /// Open or initialize a repository.
    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join("HEAD").exists() {
            Self::open(path)
        } else {
            Self::init(path)
        }
    }

    fn from_repository(repo: Repository, path: &Path) -> Self {
        Self {
            inner: Arc::new(GitBackendInner {
                idle: Mutex::new(vec![repo]),
                path: path.to_path_buf(),
            }),
        }
    }

    /// Get the repository path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Execute a function with a repository handle of its own.
    ///
    /// Handles come from the pool, or are opened when every pooled one is in
    /// use, so calls on different threads run side by side.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let pooled = self.inner.idle.lock().pop();
        let repo = match pooled {
            Some(repo) => repo,
            None => Repository::open_bare(&self.inner.path)?,
        };
        let result = f(&repo);

        let mut idle = self.inner.idle.lock();
        if idle.len() < MAX_IDLE_HANDLES {
            idle.push(repo);
        }
        result
    }

    // ==================== Documents ====================

    /// Read-modify-write a JSON document behind `refname`.
    ///
    /// `change` returns false when there is nothing to write. Returns false
    /// if the ref kept moving for `MAX_REF_ATTEMPTS` rounds.
    fn update_document<T, F>(&self, refname: &str, log_message: &str, mut change: F) -> StorageResult<bool>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> StorageResult<bool>,
    {
        self.with_repo(|repo| {
            for attempt in 1..=MAX_REF_ATTEMPTS {
                let (current, mut value) = read_document::<T>(repo, refname)?;
                if !change(&mut value)? {
                    return Ok(true);
                }
                if swap_document(repo, refname, current, &value, log_message)? {
                    return Ok(true);
                }
                debug!(refname, attempt, "reference moved while updating, retrying");
                backoff(attempt);
            }
            warn!(refname, attempts = MAX_REF_ATTEMPTS, "giving up on contended reference");
            Ok(false)
        })
    }
}

/// ref holding the SHA-256 -> blob mapping for one object
fn content_ref(digest: &ContentDigest) -> String {
    let hex = digest.to_hex();
    format!("refs/content/{}/{}", &hex[..2], &hex[2..])
}

/// ref holding one metadata document of a database
fn database_ref(db: &DatabaseId, kind: &str) -> String {
    format!(
        "refs/dbvcs/{}/{}/{}/{}",
        ref_segment(db.owner()),
        ref_segment(db.folder()),
        ref_segment(db.name()),
        kind
    )
}

/// hex of a short component, `sha256-<digest>` of a long one
///
/// Hex output never contains `-`, so the two forms can't collide.
fn ref_segment(component: &str) -> String {
    let encoded = hex::encode(component);
    if encoded.len() <= MAX_HEX_SEGMENT {
        encoded
    } else {
        format!("sha256-{}", hex::encode(sha256(component.as_bytes())))
    }
}

/// sleep a little longer after each failed ref write
fn backoff(attempt: usize) {
    thread::sleep(Duration::from_millis(2 * attempt as u64));
}

/// another writer holds the ref, or moved it first
fn is_ref_race(e: &git2::Error) -> bool {
    matches!(e.code(), ErrorCode::Modified | ErrorCode::Exists | ErrorCode::Locked)
}

/// read a JSON document, returning the blob id the ref pointed at
fn read_document<T>(repo: &Repository, refname: &str) -> StorageResult<(Option<Oid>, T)>
where
    T: DeserializeOwned + Default,
{
    match repo.find_reference(refname) {
        Ok(reference) => {
            let oid = reference.target().ok_or_else(|| StorageError::CorruptedData {
                what: refname.to_string(),
                reason: "reference is symbolic".to_string(),
            })?;
            let blob = repo.find_blob(oid)?;
            let value = serde_json::from_slice(blob.content())?;
            Ok((Some(oid), value))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok((None, T::default())),
        Err(e) => Err(e.into()),
    }
}

/// write a JSON document and move `refname` to it if the ref still points
/// at `expected`; returns false if it didn't
fn swap_document<T: Serialize>(
    repo: &Repository,
    refname: &str,
    expected: Option<Oid>,
    value: &T,
    log_message: &str,
) -> StorageResult<bool> {
    let bytes = serde_json::to_vec(value)?;
    let oid = repo.blob(&bytes)?;
    let result = match expected {
        Some(current) => repo.reference_matching(refname, oid, true, current, log_message),
        None => repo.reference(refname, oid, false, log_message),
    };
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_ref_race(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl ContentStore for GitBackend {
    fn put(&self, bytes: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::of(bytes);
        let refname = content_ref(&digest);
        self.with_repo(|repo| {
            if repo.find_reference(&refname).is_ok() {
                return Ok(());
            }
            let oid = repo.blob(bytes)?;
            for attempt in 1..=MAX_REF_ATTEMPTS {
                match repo.reference(&refname, oid, false, "store content") {
                    Ok(_) => {
                        debug!(digest = %digest.short(), size = bytes.len(), "stored object");
                        return Ok(());
                    }
                    // another writer stored the same bytes first
                    Err(e) if e.code() == ErrorCode::Exists => return Ok(()),
                    Err(e) if e.code() == ErrorCode::Locked => backoff(attempt),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(StorageError::Internal(format!("content ref {} stayed locked", refname)))
        })?;
        Ok(digest)
    }

    fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let bytes = self.with_repo(|repo| {
            let reference = match repo.find_reference(&content_ref(digest)) {
                Ok(reference) => reference,
                Err(e) if e.code() == ErrorCode::NotFound => {
                    return Err(StorageError::BlobNotFound(*digest));
                }
                Err(e) => return Err(e.into()),
            };
            let blob = reference.peel_to_blob()?;
            Ok(blob.content().to_vec())
        })?;
        verify_content(digest, &bytes)?;
        Ok(bytes)
    }

    fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        self.with_repo(|repo| match repo.find_reference(&content_ref(digest)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
    }
}

impl MetadataStore for GitBackend {
    fn load_commits(&self, db: &DatabaseId) -> StorageResult<CommitSet> {
        self.with_repo(|repo| Ok(read_document(repo, &database_ref(db, "commits"))?.1))
    }

    fn store_commits(&self, db: &DatabaseId, commits: &CommitSet) -> StorageResult<()> {
        let refname = database_ref(db, "commits");
        let stored = self.update_document(&refname, "store commits", |existing: &mut CommitSet| {
            Ok(existing.union(commits.iter().cloned()) > 0)
        })?;
        if !stored {
            return Err(StorageError::Contended {
                database: db.to_string(),
            });
        }
        debug!(database = %db, count = commits.len(), "stored commits");
        Ok(())
    }

    fn load_branches(&self, db: &DatabaseId) -> StorageResult<BranchRegistry> {
        self.with_repo(|repo| Ok(read_document(repo, &database_ref(db, "branches"))?.1))
    }

    fn store_branches(&self, db: &DatabaseId, branches: &BranchRegistry) -> StorageResult<()> {
        let refname = database_ref(db, "branches");
        self.with_repo(|repo| {
            let bytes = serde_json::to_vec(branches)?;
            let oid = repo.blob(&bytes)?;
            repo.reference(&refname, oid, true, "store branches")?;
            Ok(())
        })
    }

    fn modify_branches(
        &self,
        db: &DatabaseId,
        change: &mut dyn FnMut(&mut BranchRegistry) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let refname = database_ref(db, "branches");
        let updated = self.update_document(&refname, "update branches", |registry: &mut BranchRegistry| {
            change(registry)?;
            Ok(true)
        })?;
        if !updated {
            return Err(StorageError::Contended {
                database: db.to_string(),
            });
        }
        debug!(database = %db, "updated branches");
        Ok(())
    }
}
