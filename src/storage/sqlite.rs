//! Relational record store (SQLite)
//!
//! ## Tables
//!
//! - `users` - one row per record (uuid, pub_key, hash)
//! - `pub_keys` - secondary index pub_key -> uuid
//!
//! Both tables change inside one transaction per write.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome, UserRecord};
use crate::types::{ContinuebeeError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    uuid    TEXT PRIMARY KEY NOT NULL,
    pub_key TEXT NOT NULL,
    hash    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pub_keys (
    pub_key TEXT PRIMARY KEY NOT NULL,
    uuid    TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    on_disk: bool,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite record store at {:?}", path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
            on_disk: true,
        };
        store.with_conn(init_schema)?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite record store");

        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            on_disk: false,
        };
        store.with_conn(init_schema)?;
        Ok(store)
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ContinuebeeError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }
}

fn init_schema(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?
        .unwrap_or(0);

    if version < SCHEMA_VERSION {
        info!("Creating record schema v{}", SCHEMA_VERSION);
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
        tx.commit()?;
    }
    Ok(())
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        public_key: row.get(1)?,
        hash: row.get(2)?,
    })
}

fn select_record(conn: &Connection, id: &str) -> Result<Option<UserRecord>> {
    Ok(conn
        .query_row(
            "SELECT uuid, pub_key, hash FROM users WHERE uuid = ?1",
            params![id],
            row_to_record,
        )
        .optional()?)
}

fn select_by_public_key(conn: &Connection, public_key: &str) -> Result<Option<UserRecord>> {
    Ok(conn
        .query_row(
            "SELECT u.uuid, u.pub_key, u.hash
             FROM pub_keys k JOIN users u ON u.uuid = k.uuid
             WHERE k.pub_key = ?1",
            params![public_key],
            row_to_record,
        )
        .optional()?)
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>> {
        self.with_conn(|conn| select_record(conn, id))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<UserRecord>> {
        self.with_conn(|conn| select_by_public_key(conn, public_key))
    }

    async fn insert_if_key_absent(&self, draft: RecordDraft) -> Result<InsertOutcome> {
        let record = draft.into_record();

        let existing = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if let Some(existing) = select_by_public_key(&tx, &record.public_key)? {
                return Ok(Some(existing));
            }

            tx.execute(
                "INSERT INTO users (uuid, pub_key, hash) VALUES (?1, ?2, ?3)",
                params![record.id, record.public_key, record.hash],
            )?;
            // An index row whose record is gone is taken over
            tx.execute(
                "INSERT INTO pub_keys (pub_key, uuid) VALUES (?1, ?2)
                 ON CONFLICT(pub_key) DO UPDATE SET uuid = excluded.uuid",
                params![record.public_key, record.id],
            )?;
            tx.commit()?;
            Ok(None)
        })?;

        match existing {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => {
                debug!(id = %record.id, "Inserted record in SQLite");
                Ok(InsertOutcome::Inserted(record))
            }
        }
    }

    async fn put(&self, draft: RecordDraft) -> Result<UserRecord> {
        let record = draft.into_record();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let previous_key: Option<String> = tx
                .query_row(
                    "SELECT pub_key FROM users WHERE uuid = ?1",
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO users (uuid, pub_key, hash) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uuid) DO UPDATE SET pub_key = excluded.pub_key, hash = excluded.hash",
                params![record.id, record.public_key, record.hash],
            )?;

            if let Some(old_key) = previous_key.filter(|k| *k != record.public_key) {
                tx.execute(
                    "DELETE FROM pub_keys WHERE pub_key = ?1 AND uuid = ?2",
                    params![old_key, record.id],
                )?;
            }

            tx.execute(
                "INSERT INTO pub_keys (pub_key, uuid) VALUES (?1, ?2)
                 ON CONFLICT(pub_key) DO UPDATE SET uuid = excluded.uuid",
                params![record.public_key, record.id],
            )?;

            tx.commit()?;
            Ok(())
        })?;

        debug!(id = %record.id, "Stored record in SQLite");
        Ok(record)
    }

    async fn swap_hash(&self, id: &str, expected: &str, new_hash: &str) -> Result<SwapOutcome> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET hash = ?3 WHERE uuid = ?1 AND hash = ?2",
                params![id, expected, new_hash],
            )?;

            match (changed, select_record(conn, id)?) {
                (1, Some(record)) => Ok(SwapOutcome::Swapped(record)),
                (_, Some(_)) => Ok(SwapOutcome::Stale),
                (_, None) => Ok(SwapOutcome::Missing),
            }
        })
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let public_key: Option<String> = tx
                .query_row(
                    "SELECT pub_key FROM users WHERE uuid = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(public_key) = public_key else {
                return Ok(false);
            };

            tx.execute("DELETE FROM users WHERE uuid = ?1", params![id])?;
            tx.execute(
                "DELETE FROM pub_keys WHERE pub_key = ?1 AND uuid = ?2",
                params![public_key, id],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    async fn close(&self) -> Result<()> {
        if self.on_disk {
            self.with_conn(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })?;
            debug!("Checkpointed SQLite record store");
        }
        Ok(())
    }
}
