//! Shared fixtures for engine tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::engine::clock::FixedClock;
use crate::engine::config::EngineConfig;
use crate::engine::identity::{StaticIdentityResolver, UserIdentity};
use crate::engine::manager::{AuthorSpec, Engine, NewCommit};
use crate::storage::{DatabaseId, MemoryContentStore, MemoryMetadataStore};

pub(crate) struct TestEngine {
    pub engine: Engine,
    pub content: Arc<MemoryContentStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub clock: Arc<FixedClock>,
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::seconds(secs)
}

pub(crate) fn db() -> DatabaseId {
    DatabaseId::new("alice", "stats.sqlite").unwrap()
}

pub(crate) fn users() -> StaticIdentityResolver {
    StaticIdentityResolver::new()
        .with_user("alice", UserIdentity::new("Alice Smith", "alice@example.com"))
        .with_user("bob", UserIdentity::new("Bob Jones", "bob@example.com"))
        .with_user("carol", UserIdentity::new("Carol", ""))
}

/// an upload of `stats.sqlite` by alice
pub(crate) fn alice_upload(bytes: &[u8]) -> NewCommit {
    NewCommit::new(AuthorSpec::User("alice".to_string())).file("stats.sqlite", bytes.to_vec(), at(0))
}

pub(crate) fn setup() -> TestEngine {
    setup_with(EngineConfig::default())
}

pub(crate) fn setup_with(config: EngineConfig) -> TestEngine {
    let content = Arc::new(MemoryContentStore::new());
    let metadata = Arc::new(MemoryMetadataStore::new());
    let clock = Arc::new(FixedClock::new(at(0)));
    let engine = Engine::builder()
        .config(config)
        .content_store(content.clone())
        .metadata_store(metadata.clone())
        .identity_resolver(Arc::new(users()))
        .clock(clock.clone())
        .build()
        .unwrap();
    TestEngine {
        engine,
        content,
        metadata,
        clock,
    }
}
