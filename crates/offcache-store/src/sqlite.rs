//! SQLite-backed partition store and sync log.
//!
//! One database file holds every partition and the sync log, so both survive
//! process restarts together.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use offcache_common::{OfflineError, OptionExt, Result, ResultExt};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::{
    now_millis, CacheEntry, CacheKey, PartitionHandle, PartitionStore, PendingSyncItem, QueueLog,
    SyncItemId,
};

/// Database schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// SQLite implementation of [`PartitionStore`] and [`QueueLog`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).storage_context("Failed to open offline database")?;
        info!(path = %path.display(), "Opened offline database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().storage_context("Failed to open database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])
            .storage_context("Failed to enable foreign keys")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OfflineError::storage("database connection lock poisoned"))
    }
}

/// Create or migrate the schema.
fn init_schema(conn: &Connection) -> Result<()> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get::<_, i32>(0).map(|count| count > 0),
        )
        .unwrap_or(false);

    let version: i32 = if table_exists {
        conn.query_row(
            "SELECT version FROM schema_version ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .storage_context("Failed to read schema version")?
        .unwrap_or(0)
    } else {
        0
    };

    if version < 1 {
        create_schema_v1(conn)?;
    }
    if version < 2 {
        migrate_to_v2(conn)?;
    }

    Ok(())
}

/// Create initial schema (version 1)
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version INTEGER NOT NULL,
            applied_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS partitions (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cache_entries (
            partition TEXT NOT NULL REFERENCES partitions(name) ON DELETE CASCADE,
            cache_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            PRIMARY KEY (partition, cache_key)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_order ON cache_entries(partition, seq);

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .storage_context("Failed to create schema")?;

    record_version(conn, 1)
}

/// Migrate to schema version 2 (add last_attempt_at to the sync log)
fn migrate_to_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE sync_queue ADD COLUMN last_attempt_at INTEGER", [])
        .storage_context("Failed to add last_attempt_at column")?;

    record_version(conn, SCHEMA_VERSION)
}

fn record_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        params![version, now_millis()],
    )
    .storage_context("Failed to record schema version")?;
    debug!(version, "Schema version applied");
    Ok(())
}

fn ensure_partition(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![name, now_millis()],
    )
    .storage_context(format!("Failed to create partition {name}"))?;
    Ok(())
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, i64, u32, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

#[async_trait]
impl PartitionStore for SqliteStore {
    async fn open(&self, name: &str) -> Result<PartitionHandle> {
        ensure_partition(&*self.conn()?, name)?;
        Ok(PartitionHandle::new(name))
    }

    async fn get(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT status, headers, body, seq FROM cache_entries
                 WHERE partition = ? AND cache_key = ?",
                params![handle.name(), key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .storage_context(format!("Failed to read {key}"))?;

        match row {
            Some((status, headers, body, seq)) => Ok(Some(CacheEntry {
                status,
                headers: serde_json::from_str(&headers)?,
                body,
                inserted_at: seq as u64,
            })),
            None => Ok(None),
        }
    }

    async fn put(&self, handle: &PartitionHandle, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        let headers = serde_json::to_string(&entry.headers)?;
        let conn = self.conn()?;
        ensure_partition(&conn, handle.name())?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (partition, cache_key, seq, status, headers, body)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM cache_entries), ?3, ?4, ?5)",
            params![handle.name(), key.as_str(), entry.status, headers, entry.body],
        )
        .storage_context(format!("Failed to write {key}"))?;
        Ok(())
    }

    async fn delete(&self, handle: &PartitionHandle, key: &CacheKey) -> Result<bool> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ?",
                params![handle.name(), key.as_str()],
            )
            .storage_context(format!("Failed to delete {key}"))?;
        Ok(removed > 0)
    }

    async fn list_keys(&self, handle: &PartitionHandle) -> Result<Vec<CacheKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT cache_key FROM cache_entries WHERE partition = ? ORDER BY seq ASC")
            .storage_context("Failed to prepare key listing")?;
        let keys = stmt
            .query_map([handle.name()], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .storage_context(format!("Failed to list keys of {}", handle.name()))?;
        Ok(keys.into_iter().map(CacheKey::from_raw).collect())
    }

    async fn delete_store(&self, name: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM partitions WHERE name = ?", [name])
            .storage_context(format!("Failed to delete partition {name}"))?;
        Ok(removed > 0)
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM partitions ORDER BY name ASC")
            .storage_context("Failed to prepare partition listing")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .storage_context("Failed to list partitions")?;
        Ok(names)
    }
}

#[async_trait]
impl QueueLog for SqliteStore {
    async fn append(&self, payload: serde_json::Value) -> Result<PendingSyncItem> {
        let created_at = now_millis();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_queue (payload, created_at, attempts) VALUES (?, ?, 0)",
            params![payload.to_string(), created_at],
        )
        .storage_context("Failed to append sync item")?;

        Ok(PendingSyncItem {
            id: SyncItemId(conn.last_insert_rowid() as u64),
            payload,
            created_at,
            attempts: 0,
            last_attempt_at: None,
        })
    }

    async fn items(&self) -> Result<Vec<PendingSyncItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, payload, created_at, attempts, last_attempt_at
                 FROM sync_queue ORDER BY id ASC",
            )
            .storage_context("Failed to prepare sync listing")?;
        let rows = stmt
            .query_map([], row_to_item)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .storage_context("Failed to read sync queue")?;

        rows.into_iter()
            .map(|(id, payload, created_at, attempts, last_attempt_at)| {
                Ok(PendingSyncItem {
                    id: SyncItemId(id as u64),
                    payload: serde_json::from_str(&payload)?,
                    created_at,
                    attempts,
                    last_attempt_at,
                })
            })
            .collect()
    }

    async fn remove(&self, id: SyncItemId) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM sync_queue WHERE id = ?", [id.0 as i64])
            .storage_context(format!("Failed to remove sync item {id}"))?;
        Ok(removed > 0)
    }

    async fn record_failure(&self, id: SyncItemId) -> Result<u32> {
        let conn = self.conn()?;
        conn.query_row(
            "UPDATE sync_queue SET attempts = attempts + 1, last_attempt_at = ?
             WHERE id = ? RETURNING attempts",
            params![now_millis(), id.0 as i64],
            |row| row.get::<_, u32>(0),
        )
        .optional()
        .storage_context(format!("Failed to update sync item {id}"))?
        .ok_or_not_found(format!("sync item {id}"))
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
            .storage_context("Failed to count sync queue")?;
        Ok(count as usize)
    }
}
