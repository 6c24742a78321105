//! In-process record store
//!
//! Two concurrent maps: records by id and the public key index. DashMap
//! shards its locks, so operations on different ids do not contend.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome, UserRecord};
use crate::types::Result;

/// Record store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// id -> record
    records: DashMap<String, UserRecord>,
    /// public key -> id
    public_keys: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop an index entry only if it still belongs to `id`
    fn unindex(&self, public_key: &str, id: &str) {
        self.public_keys.remove_if(public_key, |_, owner| owner == id);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> Result<Option<UserRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Option<UserRecord>> {
        // Clone the id out before touching the other map
        let id = match self.public_keys.get(public_key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        self.get(&id).await
    }

    async fn put(&self, draft: RecordDraft) -> Result<UserRecord> {
        let record = draft.into_record();

        if let Some(previous) = self.records.insert(record.id.clone(), record.clone()) {
            if previous.public_key != record.public_key {
                self.unindex(&previous.public_key, &record.id);
            }
        }
        self.public_keys
            .insert(record.public_key.clone(), record.id.clone());

        debug!(id = %record.id, "Stored record in memory");
        Ok(record)
    }

    async fn insert_if_key_absent(&self, draft: RecordDraft) -> Result<InsertOutcome> {
        let record = draft.into_record();

        // The index entry stays locked until the record is in place
        match self.public_keys.entry(record.public_key.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = self.records.get(entry.get()) {
                    return Ok(InsertOutcome::Existing(existing.value().clone()));
                }
                self.records.insert(record.id.clone(), record.clone());
                entry.insert(record.id.clone());
            }
            Entry::Vacant(entry) => {
                self.records.insert(record.id.clone(), record.clone());
                entry.insert(record.id.clone());
            }
        }

        debug!(id = %record.id, "Inserted record in memory");
        Ok(InsertOutcome::Inserted(record))
    }

    async fn swap_hash(&self, id: &str, expected: &str, new_hash: &str) -> Result<SwapOutcome> {
        // get_mut holds the shard write lock across compare and set
        let Some(mut entry) = self.records.get_mut(id) else {
            return Ok(SwapOutcome::Missing);
        };
        if entry.hash != expected {
            return Ok(SwapOutcome::Stale);
        }
        entry.hash = new_hash.to_string();
        Ok(SwapOutcome::Swapped(entry.value().clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match self.records.remove(id) {
            Some((_, record)) => {
                self.unindex(&record.public_key, id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        contract::run_all(&store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_store_concurrent_contract() {
        contract::run_concurrent(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_len_tracks_records() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        let record = store.put(RecordDraft::new("K", "h")).await.unwrap();
        assert_eq!(store.len(), 1);

        store.delete(&record.id).await.unwrap();
        assert!(store.is_empty());
    }
}
