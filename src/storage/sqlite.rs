use super::{DeleteCondition, Entry, KvStore, NewEntry, PutCondition, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "key, body, owner, idx, expires_at, version";

/// SQLite-backed store. Several scopes share one database file; every condition
/// is evaluated inside the single statement that performs the write. Versions
/// come from a per-scope counter.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    scope: String,
}

impl SqliteStore {
    pub fn open(db_path: &Path, scope: &str) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
            scope: scope.to_string(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS entries (
                    scope TEXT NOT NULL,
                    key TEXT NOT NULL,
                    body TEXT NOT NULL,
                    owner TEXT,
                    idx TEXT,
                    expires_at INTEGER,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (scope, key)
                );
                CREATE INDEX IF NOT EXISTS entries_scope_idx ON entries(scope, idx);
                CREATE TABLE IF NOT EXISTS versions (
                    scope TEXT PRIMARY KEY,
                    last INTEGER NOT NULL
                );
                ",
            )
            .map_err(|source| StoreError::Sql { source })?;
        connection
            .execute(
                "INSERT OR IGNORE INTO versions (scope, last)
                 SELECT ?1, COALESCE(MAX(version), 0) FROM entries WHERE scope = ?1",
                params![self.scope],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    /// Next version for this scope. Versions only grow, so a deleted entry's
    /// version is never handed out again.
    fn next_version(&self, connection: &Connection) -> Result<i64, StoreError> {
        connection
            .query_row(
                "INSERT INTO versions (scope, last) VALUES (?1, 1)
                 ON CONFLICT(scope) DO UPDATE SET last = versions.last + 1
                 RETURNING last",
                params![self.scope],
                |row| row.get(0),
            )
            .map_err(|source| StoreError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| StoreError::Sql { source })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection)
    }

    fn select(&self, filter: &str, value: Option<&str>) -> Result<Vec<Entry>, StoreError> {
        let connection = self.connect()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM entries WHERE scope = ?1 {filter} ORDER BY key"
        );
        let mut statement = connection
            .prepare(&sql)
            .map_err(|source| StoreError::Sql { source })?;
        let rows = match value {
            Some(value) => statement.query_map(params![self.scope, value], read_row),
            None => statement.query_map(params![self.scope], read_row),
        }
        .map_err(|source| StoreError::Sql { source })?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = row.map_err(|source| StoreError::Sql { source })?;
            entries.push(raw.decode()?);
        }
        Ok(entries)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let connection = self.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM entries WHERE scope = ?1 AND key = ?2"),
                params![self.scope, key],
                read_row,
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        raw.map(RawEntry::decode).transpose()
    }

    fn put(&self, entry: NewEntry, condition: PutCondition) -> Result<Entry, StoreError> {
        let body = serde_json::to_string(&entry.body).map_err(|source| StoreError::Encode {
            key: entry.key.clone(),
            source,
        })?;
        let connection = self.connect()?;
        let next = self.next_version(&connection)?;
        let insert = "
            INSERT INTO entries (scope, key, body, owner, idx, expires_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";
        let update_set = "
            body = excluded.body,
            owner = excluded.owner,
            idx = excluded.idx,
            expires_at = excluded.expires_at,
            version = excluded.version";

        let version: Option<i64> = match condition {
            PutCondition::Always => connection.query_row(
                &format!(
                    "{insert} ON CONFLICT(scope, key) DO UPDATE SET {update_set} RETURNING version"
                ),
                params![
                    self.scope,
                    entry.key,
                    body,
                    entry.owner,
                    entry.index,
                    entry.expires_at,
                    next
                ],
                |row| row.get(0),
            ),
            PutCondition::Absent => connection.query_row(
                &format!("{insert} ON CONFLICT(scope, key) DO NOTHING RETURNING version"),
                params![
                    self.scope,
                    entry.key,
                    body,
                    entry.owner,
                    entry.index,
                    entry.expires_at,
                    next
                ],
                |row| row.get(0),
            ),
            PutCondition::AbsentOrExpired { now } => connection.query_row(
                &format!(
                    "{insert} ON CONFLICT(scope, key) DO UPDATE SET {update_set}
                     WHERE entries.expires_at IS NOT NULL AND entries.expires_at <= ?8
                     RETURNING version"
                ),
                params![
                    self.scope,
                    entry.key,
                    body,
                    entry.owner,
                    entry.index,
                    entry.expires_at,
                    next,
                    now
                ],
                |row| row.get(0),
            ),
            PutCondition::Version(expected) => connection.query_row(
                "
                UPDATE entries
                SET body = ?3, owner = ?4, idx = ?5, expires_at = ?6, version = ?7
                WHERE scope = ?1 AND key = ?2 AND version = ?8
                RETURNING version
                ",
                params![
                    self.scope,
                    entry.key,
                    body,
                    entry.owner,
                    entry.index,
                    entry.expires_at,
                    next,
                    to_db_version(expected)
                ],
                |row| row.get(0),
            ),
        }
        .optional()
        .map_err(|source| StoreError::Sql { source })?;

        let Some(version) = version else {
            return Err(StoreError::ConditionFailed { key: entry.key });
        };
        Ok(Entry {
            key: entry.key,
            body: entry.body,
            owner: entry.owner,
            index: entry.index,
            expires_at: entry.expires_at,
            version: from_db_version(version),
        })
    }

    fn delete(&self, key: &str, condition: DeleteCondition) -> Result<bool, StoreError> {
        let connection = self.connect()?;
        let deleted = match condition {
            DeleteCondition::Always => connection.execute(
                "DELETE FROM entries WHERE scope = ?1 AND key = ?2",
                params![self.scope, key],
            ),
            DeleteCondition::Owner(owner) => connection.execute(
                "DELETE FROM entries WHERE scope = ?1 AND key = ?2 AND owner = ?3",
                params![self.scope, key, owner],
            ),
            DeleteCondition::Version(version) => connection.execute(
                "DELETE FROM entries WHERE scope = ?1 AND key = ?2 AND version = ?3",
                params![self.scope, key, to_db_version(version)],
            ),
        }
        .map_err(|source| StoreError::Sql { source })?;
        Ok(deleted > 0)
    }

    fn query_index(&self, value: &str) -> Result<Vec<Entry>, StoreError> {
        self.select("AND idx = ?2", Some(value))
    }

    fn scan(&self) -> Result<Vec<Entry>, StoreError> {
        self.select("", None)
    }
}

struct RawEntry {
    key: String,
    body: String,
    owner: Option<String>,
    index: Option<String>,
    expires_at: Option<i64>,
    version: i64,
}

impl RawEntry {
    fn decode(self) -> Result<Entry, StoreError> {
        let body: Value = serde_json::from_str(&self.body).map_err(|source| StoreError::Decode {
            key: self.key.clone(),
            source,
        })?;
        Ok(Entry {
            key: self.key,
            body,
            owner: self.owner,
            index: self.index,
            expires_at: self.expires_at,
            version: from_db_version(self.version),
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        key: row.get(0)?,
        body: row.get(1)?,
        owner: row.get(2)?,
        index: row.get(3)?,
        expires_at: row.get(4)?,
        version: row.get(5)?,
    })
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_db_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}
