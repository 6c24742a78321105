//! Record storage
//!
//! One persisted entity, the user record `{uuid, pubKey, hash}`, plus a
//! secondary index `pubKey -> uuid`. Every backend implements the same
//! [`RecordStore`] contract so that swapping backends never changes how the
//! identity service behaves:
//!
//! - a `put` is visible to the next `get` of the same id
//! - the primary write and its index entry land together
//! - a `delete` only drops the index entry if it still points at the
//!   deleted id
//!
//! ## Backends
//!
//! | URI              | Backend                         |
//! |------------------|---------------------------------|
//! | `memory:`        | [`MemoryStore`] (DashMap)       |
//! | `sled:<dir>`     | [`SledStore`] (embedded KV)     |
//! | `sqlite:<file>`  | [`SqliteStore`] (relational)    |
//! | `file:<dir>`     | [`FileStore`] (sharded files)   |
//! | `<dir>`          | [`FileStore`]                   |

pub mod file;
pub mod memory;
pub mod sled_store;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod contract;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::generate_id;
use crate::types::{ContinuebeeError, Result};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sled_store::SledStore;
pub use sqlite::SqliteStore;

/// The persisted user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(rename = "pubKey")]
    pub public_key: String,
    pub hash: String,
}

/// A record about to be written. Without an id the store assigns one.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub id: Option<String>,
    pub public_key: String,
    pub hash: String,
}

impl RecordDraft {
    pub fn new(public_key: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: None,
            public_key: public_key.into(),
            hash: hash.into(),
        }
    }

    pub fn existing(record: &UserRecord) -> Self {
        Self {
            id: Some(record.id.clone()),
            public_key: record.public_key.clone(),
            hash: record.hash.clone(),
        }
    }

    pub fn into_record(self) -> UserRecord {
        UserRecord {
            id: self.id.unwrap_or_else(generate_id),
            public_key: self.public_key,
            hash: self.hash,
        }
    }
}

/// Outcome of a compare-and-swap on a record's hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped(UserRecord),
    /// The stored hash no longer matches the expected one
    Stale,
    Missing,
}

/// Outcome of inserting a record for a public key that may already be taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(UserRecord),
    /// The key already indexes a live record; nothing was written
    Existing(UserRecord),
}

/// Backend-agnostic record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend(&self) -> &'static str;

    async fn get(&self, id: &str) -> Result<Option<UserRecord>>;

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<UserRecord>>;

    /// Insert or overwrite. Assigns an id when the draft has none,
    /// otherwise overwrites in place keeping the id. Points the public key
    /// index at the written record.
    async fn put(&self, draft: RecordDraft) -> Result<UserRecord>;

    /// Insert a fresh record and index it, unless the public key already
    /// indexes a live record. The check and the write are one atomic step,
    /// so of two racing inserts for the same key exactly one is `Inserted`.
    async fn insert_if_key_absent(&self, draft: RecordDraft) -> Result<InsertOutcome>;

    /// Replace the hash only if it still equals `expected`
    async fn swap_hash(&self, id: &str, expected: &str, new_hash: &str) -> Result<SwapOutcome>;

    /// Remove a record. Returns false if there was nothing to remove.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Flush and release backend resources
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Parsed `STORAGE_URI`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    Memory,
    Sled(PathBuf),
    /// `None` means an in-memory SQLite database
    Sqlite(Option<PathBuf>),
    File(PathBuf),
}

impl StorageUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ContinuebeeError::Config("STORAGE_URI is empty".into()));
        }

        match uri.split_once(':') {
            Some(("memory", _)) => Ok(Self::Memory),
            Some(("sled", path)) => Ok(Self::Sled(non_empty_path(path, "sled")?)),
            Some(("sqlite", ":memory:")) => Ok(Self::Sqlite(None)),
            Some(("sqlite", path)) => Ok(Self::Sqlite(Some(non_empty_path(path, "sqlite")?))),
            Some(("file", path)) => Ok(Self::File(non_empty_path(path, "file")?)),
            Some((scheme, _)) if is_scheme(scheme) => Err(ContinuebeeError::Config(format!(
                "Unsupported storage scheme: {}",
                scheme
            ))),
            // No scheme: a plain directory path for the file store
            _ => Ok(Self::File(PathBuf::from(uri))),
        }
    }
}

fn is_scheme(s: &str) -> bool {
    // A single letter is a Windows drive, not a scheme
    s.len() > 1 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
}

fn non_empty_path(path: &str, scheme: &str) -> Result<PathBuf> {
    let path = path.trim_start_matches("//");
    if path.is_empty() {
        return Err(ContinuebeeError::Config(format!(
            "{} storage URI needs a path",
            scheme
        )));
    }
    Ok(PathBuf::from(path))
}

/// Backend tuning that only some backends use
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Number of 3-character directory levels for the file store
    pub file_key_depth: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { file_key_depth: 2 }
    }
}

/// Open the backend named by a storage URI
pub async fn open_store(uri: &StorageUri, options: &StoreOptions) -> Result<Arc<dyn RecordStore>> {
    let store: Arc<dyn RecordStore> = match uri {
        StorageUri::Memory => Arc::new(MemoryStore::new()),
        StorageUri::Sled(path) => Arc::new(SledStore::open(path)?),
        StorageUri::Sqlite(Some(path)) => Arc::new(SqliteStore::open(path)?),
        StorageUri::Sqlite(None) => Arc::new(SqliteStore::open_in_memory()?),
        StorageUri::File(path) => Arc::new(FileStore::open(path, options.file_key_depth).await?),
    };
    info!(backend = store.backend(), "Record store opened");
    Ok(store)
}
