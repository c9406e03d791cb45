//! tree operations for commit snapshots.
//!
//! A tree is the set of files one commit captures. In the hosted system this
//! is usually a single database file, but nothing here assumes that:
//! - each entry names a file and points at its bytes in the content store
//! - entry order is part of the tree's identity and is preserved
//! - entry names are unique within a tree
//!
//! Trees are values. Changes go through [`TreeBuilder`], which produces a new
//! tree and leaves the original untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::content::ContentStore;
use crate::storage::error::StorageResult;
use crate::storage::types::{
    format_timestamp, is_whole_seconds, sha256, truncate_to_seconds, ContentDigest, InvalidNameError, TreeId,
};

/// one file inside a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntryRecord", into = "EntryRecord")]
pub struct Entry {
    /// file name, unique within its tree
    pub name: String,
    /// digest of the file's bytes in the content store
    pub content_digest: ContentDigest,
    /// size of the file in bytes
    pub size: i64,
    /// when the file was last modified (whole seconds)
    pub last_modified: DateTime<Utc>,
}

/// on-disk form of an entry; the name and timestamp are re-checked on load
#[derive(Serialize, Deserialize)]
struct EntryRecord {
    name: String,
    sha256: ContentDigest,
    size: i64,
    last_modified: DateTime<Utc>,
}

impl TryFrom<EntryRecord> for Entry {
    type Error = String;

    fn try_from(record: EntryRecord) -> Result<Self, Self::Error> {
        Entry::validate_name(&record.name).map_err(|e| e.to_string())?;
        if !is_whole_seconds(&record.last_modified) {
            return Err(format!(
                "last_modified of entry '{}' has a sub-second part",
                record.name
            ));
        }
        Ok(Entry {
            name: record.name,
            content_digest: record.sha256,
            size: record.size,
            last_modified: record.last_modified,
        })
    }
}

impl From<Entry> for EntryRecord {
    fn from(entry: Entry) -> Self {
        EntryRecord {
            name: entry.name,
            sha256: entry.content_digest,
            size: entry.size,
            last_modified: entry.last_modified,
        }
    }
}

impl Entry {
    const MAX_NAME_LEN: usize = 1024;

    /// create an entry, truncating `last_modified` to whole seconds
    pub fn new(
        name: impl Into<String>,
        content_digest: ContentDigest,
        size: i64,
        last_modified: DateTime<Utc>,
    ) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate_name(&name)?;
        Ok(Self {
            name,
            content_digest,
            size,
            last_modified: truncate_to_seconds(last_modified),
        })
    }

    /// store `bytes` in the content store and describe them as an entry
    pub fn store(
        store: &dyn ContentStore,
        name: impl Into<String>,
        bytes: &[u8],
        last_modified: DateTime<Utc>,
    ) -> StorageResult<Self> {
        let name = name.into();
        Self::validate_name(&name)?;
        let digest = store.put(bytes)?;
        Ok(Self::new(name, digest, bytes.len() as i64, last_modified)?)
    }

    fn validate_name(name: &str) -> Result<(), InvalidNameError> {
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > Self::MAX_NAME_LEN {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        Ok(())
    }

    /// append this entry's canonical line to `buf`
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"entry ");
        write_length_prefixed(buf, &self.name);
        let rest = format!(
            " {} {} {}\n",
            self.content_digest.to_hex(),
            self.size,
            format_timestamp(&self.last_modified)
        );
        buf.extend_from_slice(rest.as_bytes());
    }
}

/// append `<byte length>:<bytes>` to `buf`
pub(crate) fn write_length_prefixed(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(value.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(value.as_bytes());
}

/// an ordered list of entries with unique names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TreeRecord", into = "TreeRecord")]
pub struct Tree {
    entries: Vec<Entry>,
}

/// on-disk form of a tree; names are re-checked on load
#[derive(Serialize, Deserialize)]
struct TreeRecord {
    entries: Vec<Entry>,
}

impl TryFrom<TreeRecord> for Tree {
    type Error = InvalidNameError;

    fn try_from(record: TreeRecord) -> Result<Self, Self::Error> {
        Tree::new(record.entries)
    }
}

impl From<Tree> for TreeRecord {
    fn from(tree: Tree) -> Self {
        TreeRecord { entries: tree.entries }
    }
}

impl Tree {
    /// create a tree, rejecting duplicate entry names
    pub fn new(entries: Vec<Entry>) -> Result<Self, InvalidNameError> {
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(InvalidNameError::Duplicate(entry.name.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// a tree with no entries
    pub fn empty() -> Self {
        Self::default()
    }

    /// entries in their stored order
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// look up an entry by name
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// total size of all entries in bytes
    pub fn total_size(&self) -> i64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// content-derived id of this tree
    ///
    /// SHA-256 over the entry lines in stored order, so reordering entries
    /// gives a different id.
    pub fn id(&self) -> TreeId {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        TreeId::from_bytes(sha256(&buf))
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        for entry in &self.entries {
            entry.encode(buf);
        }
    }
}

/// Builds a modified copy of a tree.
///
/// # Usage Pattern
///
/// ```ignore
/// let mut builder = TreeBuilder::from_tree(&commit.tree);
/// builder.upsert(entry);
/// builder.remove("old.sqlite");
/// let tree = builder.build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct TreeBuilder {
    entries: Vec<Entry>,
}

impl TreeBuilder {
    /// start from an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// start from a copy of an existing tree
    pub fn from_tree(tree: &Tree) -> Self {
        Self {
            entries: tree.entries.clone(),
        }
    }

    /// insert an entry, or replace the one with the same name in place
    pub fn upsert(&mut self, entry: Entry) -> &mut Self {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    /// remove an entry by name, returning it if it was present
    pub fn remove(&mut self, name: &str) -> Option<Entry> {
        let pos = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(pos))
    }

    pub fn build(self) -> Result<Tree, InvalidNameError> {
        Tree::new(self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryContentStore;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(name: &str, content: &[u8]) -> Entry {
        Entry::new(name, ContentDigest::of(content), content.len() as i64, ts(0)).unwrap()
    }

    #[test]
    fn test_entry_truncates_timestamp() {
        let precise = ts(5) + chrono::Duration::milliseconds(250);
        let e = Entry::new("a.sqlite", ContentDigest::of(b"a"), 1, precise).unwrap();
        assert_eq!(e.last_modified, ts(5));
    }

    #[test]
    fn test_entry_rejects_empty_name() {
        let result = Entry::new("", ContentDigest::of(b"a"), 1, ts(0));
        assert_eq!(result, Err(InvalidNameError::Empty));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = Tree::new(vec![entry("a", b"1"), entry("a", b"2")]);
        assert!(matches!(result, Err(InvalidNameError::Duplicate(_))));
    }

    #[test]
    fn test_tree_id_is_stable_and_order_sensitive() {
        let t1 = Tree::new(vec![entry("a", b"1"), entry("b", b"2")]).unwrap();
        let t2 = Tree::new(vec![entry("a", b"1"), entry("b", b"2")]).unwrap();
        let swapped = Tree::new(vec![entry("b", b"2"), entry("a", b"1")]).unwrap();

        assert_eq!(t1.id(), t2.id());
        assert_ne!(t1.id(), swapped.id());
        assert_ne!(t1.id(), Tree::empty().id());
    }

    #[test]
    fn test_builder_upsert_keeps_position() {
        let original = Tree::new(vec![entry("a", b"1"), entry("b", b"2"), entry("c", b"3")]).unwrap();

        let mut builder = TreeBuilder::from_tree(&original);
        builder.upsert(entry("b", b"changed")).upsert(entry("d", b"4"));
        let updated = builder.build().unwrap();

        let names: Vec<&str> = updated.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(updated.get("b").unwrap().content_digest, ContentDigest::of(b"changed"));

        // original untouched
        assert_eq!(original.get("b").unwrap().content_digest, ContentDigest::of(b"2"));
        assert_eq!(original.len(), 3);
    }

    #[test]
    fn test_builder_remove() {
        let original = Tree::new(vec![entry("a", b"1"), entry("b", b"2")]).unwrap();
        let mut builder = TreeBuilder::from_tree(&original);
        assert!(builder.remove("a").is_some());
        assert!(builder.remove("missing").is_none());
        let updated = builder.build().unwrap();
        assert_eq!(updated.len(), 1);
        assert!(updated.get("a").is_none());
    }

    #[test]
    fn test_store_entry_dedupes_content() {
        let store = MemoryContentStore::new();
        let a = Entry::store(&store, "a.sqlite", b"same bytes", ts(0)).unwrap();
        let b = Entry::store(&store, "b.sqlite", b"same bytes", ts(1)).unwrap();

        assert_eq!(a.content_digest, b.content_digest);
        assert_eq!(a.size, 10);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_serde_rejects_sub_second_timestamp() {
        let good = serde_json::to_value(entry("a", b"1")).unwrap();
        assert_eq!(good.get("sha256").unwrap().as_str().unwrap(), ContentDigest::of(b"1").to_hex());
        assert_eq!(serde_json::from_value::<Entry>(good).unwrap(), entry("a", b"1"));

        let mut precise = entry("a", b"1");
        precise.last_modified = ts(0) + chrono::Duration::milliseconds(500);
        let json = serde_json::to_value(&precise).unwrap();
        assert!(serde_json::from_value::<Entry>(json).is_err());
    }

    #[test]
    fn test_serde_rejects_duplicates() {
        let tree = Tree::new(vec![entry("a", b"1")]).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let back: Tree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);

        let value = serde_json::to_value(entry("a", b"1")).unwrap();
        let doubled = serde_json::json!({ "entries": [value.clone(), value] });
        assert!(serde_json::from_value::<Tree>(doubled).is_err());
    }
}
