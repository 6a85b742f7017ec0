use super::{DeleteCondition, Entry, KvStore, NewEntry, PutCondition, StoreError};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// In-process store. The mutex makes each condition check and its write one
/// atomic step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    last_version: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    fn put(&self, entry: NewEntry, condition: PutCondition) -> Result<Entry, StoreError> {
        let mut state = self.lock()?;
        let existing = state.entries.get(&entry.key);
        let allowed = match (condition, existing) {
            (PutCondition::Always, _) => true,
            (PutCondition::Absent, current) => current.is_none(),
            (PutCondition::AbsentOrExpired { now }, current) => {
                current.map_or(true, |current| current.is_expired(now))
            }
            (PutCondition::Version(expected), Some(current)) => current.version == expected,
            (PutCondition::Version(_), None) => false,
        };
        if !allowed {
            return Err(StoreError::ConditionFailed { key: entry.key });
        }
        state.last_version += 1;
        let version = state.last_version;
        let stored = Entry {
            key: entry.key.clone(),
            body: entry.body,
            owner: entry.owner,
            index: entry.index,
            expires_at: entry.expires_at,
            version,
        };
        state.entries.insert(entry.key, stored.clone());
        Ok(stored)
    }

    fn delete(&self, key: &str, condition: DeleteCondition) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let Some(current) = state.entries.get(key) else {
            return Ok(false);
        };
        let allowed = match &condition {
            DeleteCondition::Always => true,
            DeleteCondition::Owner(owner) => current.owner.as_deref() == Some(owner.as_str()),
            DeleteCondition::Version(version) => current.version == *version,
        };
        if allowed {
            state.entries.remove(key);
        }
        Ok(allowed)
    }

    fn query_index(&self, value: &str) -> Result<Vec<Entry>, StoreError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|entry| entry.index.as_deref() == Some(value))
            .cloned()
            .collect())
    }

    fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        Ok(self.lock()?.entries.values().cloned().collect())
    }
}
