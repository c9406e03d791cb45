//! content-addressed blob storage.
//!
//! Every uploaded database file is stored once, keyed by the SHA-256 of its
//! bytes. Two uploads with identical content share one stored object; a
//! stored object is never rewritten in place.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::ContentDigest;

/// A content-addressed object store.
///
/// Implementations must be idempotent on `put`: the digest is computed
/// first and the bytes are written only when nothing is stored under it yet.
pub trait ContentStore: Send + Sync {
    /// store `bytes` and return their digest
    fn put(&self, bytes: &[u8]) -> StorageResult<ContentDigest>;

    /// read the bytes stored under `digest`
    ///
    /// fails with [`StorageError::BlobNotFound`] when nothing is stored
    fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// check if an object is stored under `digest`
    fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

/// check that bytes read back from a backend still hash to their key
pub fn verify_content(digest: &ContentDigest, bytes: &[u8]) -> StorageResult<()> {
    let actual = ContentDigest::of(bytes);
    if actual != *digest {
        return Err(StorageError::CorruptedData {
            what: format!("object {}", digest),
            reason: format!("content hashes to {}", actual),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_content() {
        let digest = ContentDigest::of(b"abc");
        assert!(verify_content(&digest, b"abc").is_ok());

        let result = verify_content(&digest, b"abd");
        assert!(matches!(result, Err(StorageError::CorruptedData { .. })));
    }
}
