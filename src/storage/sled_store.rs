//! Embedded KV record store (sled)
//!
//! Trees:
//! - `users`: uuid -> JSON record
//! - `public_keys`: pubKey -> uuid
//!
//! Writes touching both trees run in one multi-tree transaction.

use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec, Transactional, Tree};
use tracing::{debug, info};

use super::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome, UserRecord};
use crate::types::{ContinuebeeError, Result};

const USERS_TREE: &str = "users";
const PUBLIC_KEYS_TREE: &str = "public_keys";

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<String>>;

pub struct SledStore {
    db: Db,
    users: Tree,
    public_keys: Tree,
}

impl SledStore {
    /// Open or create the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened sled record store");
        Self::from_db(db)
    }

    /// Temporary database, removed on drop (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let users = db.open_tree(USERS_TREE)?;
        let public_keys = db.open_tree(PUBLIC_KEYS_TREE)?;
        Ok(Self {
            db,
            users,
            public_keys,
        })
    }
}

fn decode(bytes: &[u8]) -> Result<UserRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| ContinuebeeError::Storage(format!("Corrupt record: {}", e)))
}

fn abort(e: impl std::fmt::Display) -> ConflictableTransactionError<String> {
    ConflictableTransactionError::Abort(e.to_string())
}

fn from_transaction(err: TransactionError<String>) -> ContinuebeeError {
    match err {
        TransactionError::Abort(reason) => ContinuebeeError::Storage(reason),
        TransactionError::Storage(e) => e.into(),
    }
}

#[async_trait]
impl RecordStore for SledStore {
    fn backend(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>> {
        match self.users.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<UserRecord>> {
        match self.public_keys.get(public_key.as_bytes())? {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).into_owned();
                self.get(&id).await
            }
            None => Ok(None),
        }
    }

    async fn put(&self, draft: RecordDraft) -> Result<UserRecord> {
        let record = draft.into_record();
        let value = serde_json::to_vec(&record)?;
        let id = record.id.as_bytes();
        let public_key = record.public_key.as_bytes();

        (&self.users, &self.public_keys)
            .transaction(|(users, public_keys)| -> TxResult<()> {
                if let Some(previous) = users.insert(id, value.as_slice())? {
                    let previous: UserRecord = serde_json::from_slice(&previous).map_err(abort)?;
                    let old_key = previous.public_key.as_bytes();
                    if old_key != public_key
                        && public_keys.get(old_key)?.as_deref() == Some(id)
                    {
                        public_keys.remove(old_key)?;
                    }
                }
                public_keys.insert(public_key, id)?;
                Ok(())
            })
            .map_err(from_transaction)?;

        debug!(id = %record.id, "Stored record in sled");
        Ok(record)
    }

    async fn insert_if_key_absent(&self, draft: RecordDraft) -> Result<InsertOutcome> {
        let record = draft.into_record();
        let value = serde_json::to_vec(&record)?;
        let id = record.id.as_bytes();
        let public_key = record.public_key.as_bytes();

        let existing = (&self.users, &self.public_keys)
            .transaction(|(users, public_keys)| -> TxResult<Option<IVec>> {
                if let Some(owner) = public_keys.get(public_key)? {
                    if let Some(current) = users.get(&*owner)? {
                        return Ok(Some(current));
                    }
                }
                users.insert(id, value.as_slice())?;
                public_keys.insert(public_key, id)?;
                Ok(None)
            })
            .map_err(from_transaction)?;

        match existing {
            Some(bytes) => Ok(InsertOutcome::Existing(decode(&bytes)?)),
            None => {
                debug!(id = %record.id, "Inserted record in sled");
                Ok(InsertOutcome::Inserted(record))
            }
        }
    }

    async fn swap_hash(&self, id: &str, expected: &str, new_hash: &str) -> Result<SwapOutcome> {
        loop {
            let Some(current) = self.users.get(id.as_bytes())? else {
                return Ok(SwapOutcome::Missing);
            };
            let mut record = decode(&current)?;
            if record.hash != expected {
                return Ok(SwapOutcome::Stale);
            }
            record.hash = new_hash.to_string();
            let updated = serde_json::to_vec(&record)?;

            match self
                .users
                .compare_and_swap(id.as_bytes(), Some(current), Some(updated))?
            {
                Ok(()) => return Ok(SwapOutcome::Swapped(record)),
                // Someone wrote in between: re-read and re-check
                Err(_) => continue,
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let key = id.as_bytes();

        let removed = (&self.users, &self.public_keys)
            .transaction(|(users, public_keys)| -> TxResult<bool> {
                let Some(previous) = users.remove(key)? else {
                    return Ok(false);
                };
                let previous: UserRecord = serde_json::from_slice(&previous).map_err(abort)?;
                let index_key = previous.public_key.as_bytes();
                if public_keys.get(index_key)?.as_deref() == Some(key) {
                    public_keys.remove(index_key)?;
                }
                Ok(true)
            })
            .map_err(from_transaction)?;

        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        let bytes = self.db.flush_async().await?;
        debug!(bytes, "Flushed sled record store");
        Ok(())
    }
}
