//! Per-workspace leases.
//!
//! At most one live lock exists per workspace. A lock is live until
//! `expires_at`; after that any run may take it over. Each acquisition is its
//! own lease: a run that already holds the lock is busy like any other, and a
//! lease releases or renews only the exact entry it wrote. Manual release is
//! owner-checked, so a run whose lease already expired and was taken cannot
//! drop the new holder's lock.

use crate::shared::time::{add_duration, epoch_millis, from_epoch_millis, now_utc};
use crate::shared::{sleep_with_stop, EventLog, LogLevel};
use crate::storage::{DeleteCondition, Entry, KvStore, NewEntry, PutCondition, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

const ACQUIRE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceLock {
    pub workspace: String,
    pub locked_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Store version of the entry this lease wrote.
    #[serde(skip)]
    pub version: u64,
}

impl WorkspaceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn from_entry(entry: &Entry) -> Self {
        let expires_at = entry
            .expires_at
            .map(from_epoch_millis)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let acquired_at = entry
            .body
            .get("acquired_at")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(expires_at);
        Self {
            workspace: entry.key.clone(),
            locked_by: entry.owner.clone().unwrap_or_default(),
            acquired_at,
            expires_at,
            version: entry.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(WorkspaceLock),
    /// A live lock is held, possibly by this same run. Not an error.
    Busy(WorkspaceLock),
}

pub enum LeaseOutcome<'a> {
    Held(WorkspaceLease<'a>),
    Busy(WorkspaceLock),
}

#[derive(Clone)]
pub struct LockStore {
    store: Arc<dyn KvStore>,
    log: EventLog,
}

impl std::fmt::Debug for LockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockStore").finish_non_exhaustive()
    }
}

impl LockStore {
    pub fn new(store: Arc<dyn KvStore>, log: EventLog) -> Self {
        Self { store, log }
    }

    /// Takes the workspace lock for `run_id` when it is free or expired.
    pub fn acquire(
        &self,
        workspace: &str,
        run_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, StoreError> {
        let lock = WorkspaceLock {
            workspace: workspace.to_string(),
            locked_by: run_id.to_string(),
            acquired_at: now,
            expires_at: add_duration(now, ttl),
            version: 0,
        };
        let now_millis = epoch_millis(now);

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self
                .store
                .put(lock_entry(&lock), PutCondition::AbsentOrExpired { now: now_millis })
            {
                Ok(entry) => {
                    let lock = WorkspaceLock {
                        version: entry.version,
                        ..lock
                    };
                    self.log_lock(run_id, "lock.acquired", &lock);
                    return Ok(AcquireOutcome::Acquired(lock));
                }
                Err(err) if err.is_condition_failed() => {}
                Err(err) => return Err(err),
            }

            match self.store.get(workspace)? {
                Some(current) if !current.is_expired(now_millis) => {
                    return Ok(AcquireOutcome::Busy(WorkspaceLock::from_entry(&current)));
                }
                // Released or expired between our put and get; try again.
                _ => continue,
            }
        }

        match self.current(workspace, now)? {
            Some(holder) => Ok(AcquireOutcome::Busy(holder)),
            None => Err(StoreError::ConditionFailed {
                key: workspace.to_string(),
            }),
        }
    }

    /// Pushes `expires_at` out to `now + ttl` if `lock` is still the stored
    /// entry. `None` means the lease was lost to another holder or a release.
    pub fn renew(
        &self,
        lock: &WorkspaceLock,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkspaceLock>, StoreError> {
        let renewed = WorkspaceLock {
            expires_at: add_duration(now, ttl),
            ..lock.clone()
        };
        match self
            .store
            .put(lock_entry(&renewed), PutCondition::Version(lock.version))
        {
            Ok(entry) => Ok(Some(WorkspaceLock {
                version: entry.version,
                ..renewed
            })),
            Err(err) if err.is_condition_failed() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Deletes the lock only when `run_id` owns it. Returns whether a lock was
    /// removed.
    pub fn release(&self, workspace: &str, run_id: &str) -> Result<bool, StoreError> {
        let released = self
            .store
            .delete(workspace, DeleteCondition::Owner(run_id.to_string()))?;
        if released {
            self.log.run_event(
                run_id,
                LogLevel::Info,
                "lock.released",
                json!({"workspace": workspace}),
            );
        }
        Ok(released)
    }

    /// The live lock on `workspace`, ignoring an expired leftover.
    pub fn current(&self, workspace: &str, now: DateTime<Utc>) -> Result<Option<WorkspaceLock>, StoreError> {
        let now_millis = epoch_millis(now);
        Ok(self
            .store
            .get(workspace)?
            .filter(|entry| !entry.is_expired(now_millis))
            .map(|entry| WorkspaceLock::from_entry(&entry)))
    }

    pub fn live_locks(&self, now: DateTime<Utc>) -> Result<Vec<WorkspaceLock>, StoreError> {
        let now_millis = epoch_millis(now);
        Ok(self
            .store
            .scan()?
            .iter()
            .filter(|entry| !entry.is_expired(now_millis))
            .map(WorkspaceLock::from_entry)
            .collect())
    }

    /// Like [`LockStore::acquire`], but the returned guard releases the lock
    /// when it goes out of scope, on every exit path.
    pub fn acquire_lease(
        &self,
        workspace: &str,
        run_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeaseOutcome<'_>, StoreError> {
        Ok(match self.acquire(workspace, run_id, ttl, now)? {
            AcquireOutcome::Acquired(lock) => LeaseOutcome::Held(WorkspaceLease {
                locks: self,
                lock: Mutex::new(lock),
                ttl,
                released: false,
            }),
            AcquireOutcome::Busy(holder) => LeaseOutcome::Busy(holder),
        })
    }

    fn log_lock(&self, run_id: &str, event: &str, lock: &WorkspaceLock) {
        self.log.run_event(
            run_id,
            LogLevel::Info,
            event,
            json!({
                "workspace": lock.workspace,
                "expires_at": lock.expires_at,
            }),
        );
    }
}

fn lock_entry(lock: &WorkspaceLock) -> NewEntry {
    NewEntry::new(
        lock.workspace.clone(),
        json!({
            "workspace": lock.workspace,
            "locked_by": lock.locked_by,
            "acquired_at": lock.acquired_at,
            "expires_at": lock.expires_at,
        }),
    )
    .with_owner(lock.locked_by.clone())
    .with_expiry(epoch_millis(lock.expires_at))
}

/// Scoped workspace lock. Dropping it releases the entry this lease wrote,
/// and nothing else.
pub struct WorkspaceLease<'a> {
    locks: &'a LockStore,
    lock: Mutex<WorkspaceLock>,
    ttl: Duration,
    released: bool,
}

impl WorkspaceLease<'_> {
    pub fn lock(&self) -> WorkspaceLock {
        self.current().clone()
    }

    /// Extends the lease by its ttl. Returns false once the lease is lost.
    pub fn renew(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut lock = self.current();
        match self.locks.renew(&lock, self.ttl, now)? {
            Some(renewed) => {
                *lock = renewed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs `work` while a heartbeat thread renews the lease every third of
    /// its ttl, so an operation that outlives the ttl keeps the workspace.
    pub fn hold_while<T>(&self, work: impl FnOnce() -> T) -> T {
        let done = AtomicBool::new(false);
        let every = (self.ttl / 3).max(Duration::from_millis(10));
        thread::scope(|scope| {
            scope.spawn(|| {
                while sleep_with_stop(&done, every) {
                    match self.renew(now_utc()) {
                        Ok(true) => {}
                        Ok(false) => {
                            self.log_lease("lock.lost", LogLevel::Warn, None);
                            return;
                        }
                        Err(err) => {
                            self.log_lease("lock.renew_failed", LogLevel::Error, Some(&err))
                        }
                    }
                }
            });
            let _stop = StopOnDrop(&done);
            work()
        })
    }

    /// Hands the lock over to the run record: the lease stops managing it and
    /// it stays until an owner release or expiry.
    pub fn keep(mut self) -> WorkspaceLock {
        self.released = true;
        self.lock()
    }

    pub fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        self.release_entry()
    }

    fn current(&self) -> std::sync::MutexGuard<'_, WorkspaceLock> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_entry(&self) -> Result<bool, StoreError> {
        let lock = self.lock();
        let released = self
            .locks
            .store
            .delete(&lock.workspace, DeleteCondition::Version(lock.version))?;
        if released {
            self.locks.log.run_event(
                &lock.locked_by,
                LogLevel::Info,
                "lock.released",
                json!({"workspace": lock.workspace}),
            );
        }
        Ok(released)
    }

    fn log_lease(&self, event: &str, level: LogLevel, err: Option<&StoreError>) {
        let lock = self.lock();
        self.locks.log.run_event(
            &lock.locked_by,
            level,
            event,
            json!({
                "workspace": lock.workspace,
                "error": err.map(ToString::to_string),
            }),
        );
    }
}

/// Stops the heartbeat even when the work unwinds.
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl Drop for WorkspaceLease<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.release_entry() {
            self.log_lease("lock.release_failed", LogLevel::Error, Some(&err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn locks() -> LockStore {
        LockStore::new(Arc::new(MemoryStore::new()), EventLog::disabled())
    }

    #[test]
    fn second_run_is_busy_until_release() {
        let locks = locks();
        let now = Utc::now();
        assert!(matches!(
            locks.acquire("ws-1", "r1", DEFAULT_LOCK_TTL, now).expect("acquire"),
            AcquireOutcome::Acquired(_)
        ));
        match locks.acquire("ws-1", "r2", DEFAULT_LOCK_TTL, now).expect("acquire") {
            AcquireOutcome::Busy(holder) => assert_eq!(holder.locked_by, "r1"),
            other => panic!("expected busy, got {other:?}"),
        }
        assert!(locks.release("ws-1", "r1").expect("release"));
        assert!(matches!(
            locks.acquire("ws-1", "r2", DEFAULT_LOCK_TTL, now).expect("acquire"),
            AcquireOutcome::Acquired(_)
        ));
    }

    #[test]
    fn holder_is_busy_on_its_own_lock() {
        let locks = locks();
        let now = Utc::now();
        locks
            .acquire("ws-1", "r1", Duration::from_secs(10), now)
            .expect("acquire");
        match locks.acquire("ws-1", "r1", Duration::from_secs(10), now).expect("again") {
            AcquireOutcome::Busy(holder) => assert_eq!(holder.locked_by, "r1"),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn renew_extends_only_the_current_entry() {
        let locks = locks();
        let now = Utc::now();
        let lock = match locks.acquire("ws-1", "r1", Duration::from_secs(10), now).expect("acquire") {
            AcquireOutcome::Acquired(lock) => lock,
            other => panic!("expected acquire, got {other:?}"),
        };
        let later = now + chrono::Duration::seconds(5);
        let renewed = locks
            .renew(&lock, Duration::from_secs(10), later)
            .expect("renew")
            .expect("still held");
        assert_eq!(renewed.expires_at, add_duration(later, Duration::from_secs(10)));
        assert_eq!(renewed.acquired_at.timestamp_millis(), now.timestamp_millis());

        assert_eq!(locks.renew(&lock, Duration::from_secs(10), later).expect("stale"), None);
    }

    #[test]
    fn stale_lease_drop_leaves_a_newer_lease_alone() {
        let locks = locks();
        let now = Utc::now();
        let first = match locks.acquire_lease("ws-1", "r1", DEFAULT_LOCK_TTL, now).expect("lease") {
            LeaseOutcome::Held(lease) => lease,
            LeaseOutcome::Busy(_) => panic!("workspace should be free"),
        };
        assert!(locks.release("ws-1", "r1").expect("owner release"));
        let second = match locks.acquire_lease("ws-1", "r1", DEFAULT_LOCK_TTL, now).expect("lease") {
            LeaseOutcome::Held(lease) => lease,
            LeaseOutcome::Busy(_) => panic!("workspace should be free"),
        };

        drop(first);
        let holder = locks.current("ws-1", now).expect("current").expect("still held");
        assert_eq!(holder.version, second.lock().version);
        drop(second);
        assert!(locks.current("ws-1", now).expect("current").is_none());
    }

    #[test]
    fn heartbeat_keeps_a_short_lease_alive() {
        let locks = locks();
        let lease = match locks
            .acquire_lease("ws-1", "r1", Duration::from_millis(300), Utc::now())
            .expect("lease")
        {
            LeaseOutcome::Held(lease) => lease,
            LeaseOutcome::Busy(_) => panic!("workspace should be free"),
        };
        lease.hold_while(|| thread::sleep(Duration::from_millis(900)));
        let holder = locks
            .current("ws-1", Utc::now())
            .expect("current")
            .expect("renewed past its ttl");
        assert_eq!(holder.locked_by, "r1");
    }

    #[test]
    fn expired_lock_is_taken_over_and_old_holder_cannot_release_it() {
        let locks = locks();
        let now = Utc::now();
        locks.acquire("ws-1", "r1", Duration::from_secs(1), now).expect("acquire");
        let later = now + chrono::Duration::seconds(2);
        assert_eq!(locks.current("ws-1", later).expect("current"), None);
        assert!(matches!(
            locks.acquire("ws-1", "r2", Duration::from_secs(60), later).expect("steal"),
            AcquireOutcome::Acquired(_)
        ));
        assert!(!locks.release("ws-1", "r1").expect("stale release"));
        assert_eq!(
            locks.current("ws-1", later).expect("current").map(|lock| lock.locked_by),
            Some("r2".to_string())
        );
    }

    #[test]
    fn lease_guard_releases_on_drop() {
        let locks = locks();
        let now = Utc::now();
        {
            let lease = match locks.acquire_lease("ws-1", "r1", DEFAULT_LOCK_TTL, now).expect("lease") {
                LeaseOutcome::Held(lease) => lease,
                LeaseOutcome::Busy(_) => panic!("workspace should be free"),
            };
            assert_eq!(lease.lock().locked_by, "r1");
            assert!(locks.current("ws-1", now).expect("current").is_some());
        }
        assert!(locks.current("ws-1", now).expect("current").is_none());
    }
}
