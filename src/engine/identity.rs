//! Resolving usernames to commit author identities.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::storage::{Signature, StorageResult};

/// Display name and email recorded on commits a user authors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub display_name: String,
    pub email: String,
}

impl UserIdentity {
    pub fn new(display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            email: email.into(),
        }
    }

    /// check if both fields are filled in
    pub fn is_complete(&self) -> bool {
        !self.display_name.trim().is_empty() && !self.email.trim().is_empty()
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.display_name.clone(), self.email.clone())
    }
}

/// Looks up user identities, typically in the host's user database.
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` when the user doesn't exist
    fn resolve(&self, username: &str) -> StorageResult<Option<UserIdentity>>;
}

/// Map-backed resolver for tests and the CLI.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    users: RwLock<HashMap<String, UserIdentity>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// add a user, builder style
    pub fn with_user(self, username: impl Into<String>, identity: UserIdentity) -> Self {
        self.insert(username, identity);
        self
    }

    /// add or replace a user
    pub fn insert(&self, username: impl Into<String>, identity: UserIdentity) {
        self.users.write().insert(username.into(), identity);
    }

    pub fn remove(&self, username: &str) -> Option<UserIdentity> {
        self.users.write().remove(username)
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, username: &str) -> StorageResult<Option<UserIdentity>> {
        Ok(self.users.read().get(username).cloned())
    }
}
