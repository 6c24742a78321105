//! Flat-file record store
//!
//! Every key is a JSON file under the base directory. Files are sharded into
//! directories taken from the trailing characters of the key, three
//! characters per level:
//!
//! ```text
//! user_3f2a...9c41  ->  <base>/c41/ba9/user_3f2a...9c41.json
//! ```
//!
//! Keys:
//! - `user_<id>` holds the record
//! - `keys_<sha256(pubKey)>` holds the owning id
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a half-written file. Writers take per-key locks: the
//! record key first, then index keys in sorted order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome, UserRecord};
use crate::types::{ContinuebeeError, Result};

const SHARD_WIDTH: usize = 3;
const MAX_ID_LEN: usize = 128;

pub struct FileStore {
    base: PathBuf,
    key_depth: usize,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Open a store rooted at `base`, creating the directory if needed
    pub async fn open<P: AsRef<Path>>(base: P, key_depth: usize) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        info!(path = %base.display(), key_depth, "Initialized file record store");

        Ok(Self {
            base,
            key_depth,
            locks: DashMap::new(),
        })
    }

    /// Path of the file holding `key`
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        let mut rest = key;
        for _ in 0..self.key_depth {
            if rest.is_empty() {
                break;
            }
            let split = rest
                .char_indices()
                .rev()
                .nth(SHARD_WIDTH - 1)
                .map(|(i, _)| i)
                .unwrap_or(0);
            path.push(&rest[split..]);
            rest = &rest[..split];
        }
        path.push(format!("{}.json", key));
        path
    }

    async fn read_key(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for_key(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_key(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for_key(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_key(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for_key(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_record(&self, id: &str) -> Result<Option<UserRecord>> {
        match self.read_key(&user_key(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ContinuebeeError::Storage(format!("Corrupt record {}: {}", id, e))),
            None => Ok(None),
        }
    }

    async fn read_index(&self, index: &str) -> Result<Option<String>> {
        Ok(self
            .read_key(index)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Remove an index file only if it still names `id`
    async fn unindex(&self, index: &str, id: &str) -> Result<()> {
        if self.read_index(index).await?.as_deref() == Some(id) {
            self.remove_key(index).await?;
        }
        Ok(())
    }

    async fn lock(&self, key: &str) -> HeldLocks<'_> {
        self.lock_sorted(vec![key.to_string()]).await
    }

    /// Lock several keys in a stable order
    async fn lock_sorted(&self, mut keys: Vec<String>) -> HeldLocks<'_> {
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let mutex = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }
        HeldLocks {
            table: &self.locks,
            keys,
            guards,
        }
    }
}

/// Per-key locks held by one operation. Dropping them, on any exit path,
/// also prunes table entries nobody else is holding or waiting on.
struct HeldLocks<'a> {
    table: &'a DashMap<String, Arc<Mutex<()>>>,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        for key in &self.keys {
            self.table
                .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

fn user_key(id: &str) -> String {
    format!("user_{}", id)
}

fn index_key(public_key: &str) -> String {
    format!("keys_{}", hex::encode(Sha256::digest(public_key.as_bytes())))
}

/// Ids become file names, so only a safe alphabet is accepted
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl RecordStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        self.read_record(id).await
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<UserRecord>> {
        match self.read_index(&index_key(public_key)).await? {
            Some(id) if is_safe_id(&id) => self.read_record(&id).await,
            Some(id) => {
                warn!(id = %id, "Ignoring index entry with unsafe id");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, draft: RecordDraft) -> Result<UserRecord> {
        let record = draft.into_record();
        if !is_safe_id(&record.id) {
            return Err(ContinuebeeError::Storage(format!(
                "Record id is not a safe file name: {:?}",
                record.id
            )));
        }

        let record_key = user_key(&record.id);
        let new_index = index_key(&record.public_key);
        let bytes = serde_json::to_vec(&record)?;

        let _record_lock = self.lock(&record_key).await;
        let previous = self.read_record(&record.id).await?;
        let old_index = previous
            .filter(|p| p.public_key != record.public_key)
            .map(|p| index_key(&p.public_key));

        let mut index_keys = vec![new_index.clone()];
        index_keys.extend(old_index.clone());
        let _index_locks = self.lock_sorted(index_keys).await;

        self.write_key(&record_key, &bytes).await?;
        if let Some(old_index) = &old_index {
            self.unindex(old_index, &record.id).await?;
        }
        self.write_key(&new_index, record.id.as_bytes()).await?;

        debug!(id = %record.id, "Stored record file");
        Ok(record)
    }

    async fn insert_if_key_absent(&self, draft: RecordDraft) -> Result<InsertOutcome> {
        let record = draft.into_record();
        if !is_safe_id(&record.id) {
            return Err(ContinuebeeError::Storage(format!(
                "Record id is not a safe file name: {:?}",
                record.id
            )));
        }

        let record_key = user_key(&record.id);
        let index = index_key(&record.public_key);
        let bytes = serde_json::to_vec(&record)?;

        let _record_lock = self.lock(&record_key).await;
        let _index_lock = self.lock(&index).await;

        if let Some(owner) = self.read_index(&index).await?.filter(|id| is_safe_id(id)) {
            if let Some(existing) = self.read_record(&owner).await? {
                return Ok(InsertOutcome::Existing(existing));
            }
        }

        self.write_key(&record_key, &bytes).await?;
        self.write_key(&index, record.id.as_bytes()).await?;

        debug!(id = %record.id, "Inserted record file");
        Ok(InsertOutcome::Inserted(record))
    }

    async fn swap_hash(&self, id: &str, expected: &str, new_hash: &str) -> Result<SwapOutcome> {
        if !is_safe_id(id) {
            return Ok(SwapOutcome::Missing);
        }
        let record_key = user_key(id);

        let _lock = self.lock(&record_key).await;
        match self.read_record(id).await? {
            None => Ok(SwapOutcome::Missing),
            Some(record) if record.hash != expected => Ok(SwapOutcome::Stale),
            Some(mut record) => {
                record.hash = new_hash.to_string();
                self.write_key(&record_key, &serde_json::to_vec(&record)?)
                    .await?;
                Ok(SwapOutcome::Swapped(record))
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let record_key = user_key(id);

        let _record_lock = self.lock(&record_key).await;
        let Some(record) = self.read_record(id).await? else {
            return Ok(false);
        };

        let index = index_key(&record.public_key);
        let _index_lock = self.lock(&index).await;
        self.remove_key(&record_key).await?;
        self.unindex(&index, id).await?;

        Ok(true)
    }
}
