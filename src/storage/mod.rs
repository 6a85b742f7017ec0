//! Conditional key-value storage shared by the run and lock stores.
//!
//! Every write is conditional on the state of the stored entry and the check
//! happens inside the store, in the same atomic step as the write. Callers never
//! read-then-write to emulate a condition.

use serde_json::Value;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub body: Value,
    pub owner: Option<String>,
    pub index: Option<String>,
    /// Epoch milliseconds. An entry is expired once `now >= expires_at`.
    pub expires_at: Option<i64>,
    /// Strictly increasing across the whole store and never reused, even
    /// after the entry is deleted and written again.
    pub version: u64,
}

impl Entry {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now_millis >= expires_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub key: String,
    pub body: Value,
    pub owner: Option<String>,
    pub index: Option<String>,
    pub expires_at: Option<i64>,
}

impl NewEntry {
    pub fn new(key: impl Into<String>, body: Value) -> Self {
        Self {
            key: key.into(),
            body,
            owner: None,
            index: None,
            expires_at: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_index(mut self, index: Option<String>) -> Self {
        self.index = index;
        self
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    Always,
    Absent,
    /// Succeeds when no entry exists or the existing one has expired at `now`.
    AbsentOrExpired { now: i64 },
    /// Succeeds only when the stored entry still has this version.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteCondition {
    Always,
    Owner(String),
    Version(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conditional write on `{key}` was rejected")]
    ConditionFailed { key: String },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to decode stored entry `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode entry `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store state is poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Entry>, StoreError>;

    fn put(&self, entry: NewEntry, condition: PutCondition) -> Result<Entry, StoreError>;

    /// Returns whether an entry was deleted.
    fn delete(&self, key: &str, condition: DeleteCondition) -> Result<bool, StoreError>;

    fn query_index(&self, value: &str) -> Result<Vec<Entry>, StoreError>;

    fn scan(&self) -> Result<Vec<Entry>, StoreError>;
}
