//! core type-safe wrappers for the storage layer: digests, database and branch names.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// length in bytes of every digest used by the engine (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// SHA-256 over a byte slice
pub(crate) fn sha256(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(bytes).into()
}

/// Defines a digest newtype. Each kind of digest gets its own type so a blob
/// digest can't be passed where a commit id is expected.
macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) [u8; DIGEST_LEN]);

        impl $name {
            /// wrap raw digest bytes
            pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
                Self(bytes)
            }

            /// raw digest bytes
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }

            /// parse from 64 lowercase or uppercase hex characters
            pub fn from_hex(s: &str) -> Result<Self, InvalidDigestError> {
                parse_digest(s).map(Self)
            }

            /// lowercase hex form
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// short form of the digest
            pub fn short(&self) -> String {
                self.to_hex()[..8].to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = InvalidDigestError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

digest_type!(
    /// digest of a stored object's bytes (the content store key)
    ContentDigest
);

digest_type!(
    /// content-derived identifier of a commit
    CommitId
);

digest_type!(
    /// content-derived identifier of a tree
    TreeId
);

impl ContentDigest {
    /// compute the digest of some bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }
}

fn parse_digest(s: &str) -> Result<[u8; DIGEST_LEN], InvalidDigestError> {
    if s.len() != DIGEST_LEN * 2 {
        return Err(InvalidDigestError::Length(s.len()));
    }
    let mut out = [0u8; DIGEST_LEN];
    hex::decode_to_slice(s, &mut out).map_err(|_| InvalidDigestError::NotHex(s.to_string()))?;
    Ok(out)
}

/// error type for malformed digest strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidDigestError {
    Length(usize),
    NotHex(String),
}

impl fmt::Display for InvalidDigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length(len) => write!(f, "digest must be {} hex characters, got {}", DIGEST_LEN * 2, len),
            Self::NotHex(s) => write!(f, "digest is not valid hex: '{}'", s),
        }
    }
}

impl std::error::Error for InvalidDigestError {}

/// drop sub-second precision; stored timestamps must survive the canonical
/// RFC 3339 form unchanged
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// check that a timestamp has no sub-second part
pub fn is_whole_seconds(ts: &DateTime<Utc>) -> bool {
    ts.timestamp_subsec_nanos() == 0
}

/// canonical text form of a timestamp: RFC 3339, UTC, whole seconds, `Z`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Identity of one hosted database: (owner, folder, name).
///
/// Commit sets and branch registries are scoped to exactly one of these;
/// nothing is shared across databases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatabaseId {
    owner: String,
    folder: String,
    name: String,
}

impl DatabaseId {
    /// the folder used when none is given
    pub const ROOT_FOLDER: &'static str = "/";

    const MAX_LEN: usize = 256;

    /// create a database id in the root folder
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, InvalidNameError> {
        Self::with_folder(owner, Self::ROOT_FOLDER, name)
    }

    /// create a database id in a specific folder
    pub fn with_folder(
        owner: impl Into<String>,
        folder: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, InvalidNameError> {
        let owner = owner.into();
        let folder = folder.into();
        let name = name.into();

        Self::validate_component(&owner)?;
        Self::validate_component(&name)?;
        Self::validate_folder(&folder)?;

        Ok(Self { owner, folder, name })
    }

    fn validate_component(value: &str) -> Result<(), InvalidNameError> {
        if value.trim().is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if value.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(value.len()));
        }
        for (i, c) in value.chars().enumerate() {
            if c == '/' || c.is_control() {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }
        Ok(())
    }

    fn validate_folder(folder: &str) -> Result<(), InvalidNameError> {
        if !folder.starts_with('/') || !folder.ends_with('/') || folder.contains("//") {
            return Err(InvalidNameError::InvalidPath(folder.to_string()));
        }
        if folder.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(folder.len()));
        }
        if let Some((i, c)) = folder.chars().enumerate().find(|(_, c)| c.is_control()) {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
        Ok(())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.owner, self.folder, self.name)
    }
}

/// a validated branch name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// the default branch name
    pub const MAIN: &'static str = "main";

    const MAX_LEN: usize = 255;

    /// create a new BranchName
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), InvalidNameError> {
        if name.trim().is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.len() > Self::MAX_LEN {
            return Err(InvalidNameError::TooLong(name.len()));
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') {
            return Err(InvalidNameError::InvalidPath(name.to_string()));
        }
        if let Some((i, c)) = name.chars().enumerate().find(|(_, c)| c.is_control()) {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
        Ok(())
    }

    /// the main branch
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for BranchName {
    type Error = InvalidNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

impl FromStr for BranchName {
    type Err = InvalidNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// author of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// error type for invalid names (databases, branches, entries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
    InvalidPath(String),
    Duplicate(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} bytes", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character {:?} at position {}", char, position)
            }
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
            Self::Duplicate(name) => write!(f, "duplicate name: '{}'", name),
        }
    }
}

impl std::error::Error for InvalidNameError {}
