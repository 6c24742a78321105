//! Behaviour every [`RecordStore`] backend must share.
//!
//! Each backend's test module runs [`run_all`] against a fresh instance, and
//! [`run_concurrent`] on a multi-thread runtime.

use std::sync::Arc;

use super::{InsertOutcome, RecordDraft, RecordStore, SwapOutcome};

const RACERS: usize = 8;
const ROUNDS: usize = 10;

pub async fn run_all(store: &dyn RecordStore) {
    put_assigns_id_and_is_readable(store).await;
    put_with_id_overwrites_in_place(store).await;
    index_follows_latest_put(store).await;
    insert_keeps_first_owner(store).await;
    swap_hash_is_compare_and_swap(store).await;
    delete_removes_record_and_index(store).await;
    delete_keeps_index_owned_by_other_id(store).await;
    absent_lookups(store).await;
}

async fn put_assigns_id_and_is_readable(store: &dyn RecordStore) {
    let put = store.put(RecordDraft::new("pk-read", "h1")).await.unwrap();
    assert!(!put.id.is_empty());

    let got = store.get(&put.id).await.unwrap();
    assert_eq!(got.as_ref(), Some(&put));

    let by_key = store.get_by_public_key("pk-read").await.unwrap();
    assert_eq!(by_key, Some(put));
}

async fn put_with_id_overwrites_in_place(store: &dyn RecordStore) {
    let first = store.put(RecordDraft::new("pk-overwrite", "h1")).await.unwrap();

    let mut draft = RecordDraft::existing(&first);
    draft.hash = "h2".into();
    let second = store.put(draft).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(store.get(&first.id).await.unwrap().unwrap().hash, "h2");
    assert_eq!(
        store.get_by_public_key("pk-overwrite").await.unwrap().unwrap().hash,
        "h2"
    );
}

async fn index_follows_latest_put(store: &dyn RecordStore) {
    let old = store.put(RecordDraft::new("pk-reuse", "h1")).await.unwrap();
    let new = store.put(RecordDraft::new("pk-reuse", "h2")).await.unwrap();
    assert_ne!(old.id, new.id);

    let indexed = store.get_by_public_key("pk-reuse").await.unwrap().unwrap();
    assert_eq!(indexed.id, new.id);
    // The older record is still reachable by id
    assert!(store.get(&old.id).await.unwrap().is_some());
}

async fn insert_keeps_first_owner(store: &dyn RecordStore) {
    let first = match store
        .insert_if_key_absent(RecordDraft::new("pk-insert", "h1"))
        .await
        .unwrap()
    {
        InsertOutcome::Inserted(record) => record,
        other => panic!("expected insert, got {:?}", other),
    };

    assert_eq!(
        store
            .insert_if_key_absent(RecordDraft::new("pk-insert", "h2"))
            .await
            .unwrap(),
        InsertOutcome::Existing(first.clone())
    );
    assert_eq!(store.get_by_public_key("pk-insert").await.unwrap(), Some(first.clone()));

    // Once the owner is gone the key is free again
    assert!(store.delete(&first.id).await.unwrap());
    match store
        .insert_if_key_absent(RecordDraft::new("pk-insert", "h3"))
        .await
        .unwrap()
    {
        InsertOutcome::Inserted(record) => assert_ne!(record.id, first.id),
        other => panic!("expected insert, got {:?}", other),
    }
}

async fn swap_hash_is_compare_and_swap(store: &dyn RecordStore) {
    let record = store.put(RecordDraft::new("pk-swap", "h1")).await.unwrap();

    match store.swap_hash(&record.id, "h1", "h2").await.unwrap() {
        SwapOutcome::Swapped(updated) => {
            assert_eq!(updated.id, record.id);
            assert_eq!(updated.public_key, "pk-swap");
            assert_eq!(updated.hash, "h2");
        }
        other => panic!("expected swap, got {:?}", other),
    }

    // Second writer racing from the same old hash loses
    assert_eq!(
        store.swap_hash(&record.id, "h1", "h3").await.unwrap(),
        SwapOutcome::Stale
    );
    assert_eq!(store.get(&record.id).await.unwrap().unwrap().hash, "h2");

    assert_eq!(
        store.swap_hash("no-such-id", "h1", "h2").await.unwrap(),
        SwapOutcome::Missing
    );
}

async fn delete_removes_record_and_index(store: &dyn RecordStore) {
    let record = store.put(RecordDraft::new("pk-delete", "h1")).await.unwrap();

    assert!(store.delete(&record.id).await.unwrap());
    assert!(store.get(&record.id).await.unwrap().is_none());
    assert!(store.get_by_public_key("pk-delete").await.unwrap().is_none());

    assert!(!store.delete(&record.id).await.unwrap());
}

async fn delete_keeps_index_owned_by_other_id(store: &dyn RecordStore) {
    let old = store.put(RecordDraft::new("pk-orphan", "h1")).await.unwrap();
    let new = store.put(RecordDraft::new("pk-orphan", "h2")).await.unwrap();

    assert!(store.delete(&old.id).await.unwrap());
    let indexed = store.get_by_public_key("pk-orphan").await.unwrap().unwrap();
    assert_eq!(indexed.id, new.id);
}

async fn absent_lookups(store: &dyn RecordStore) {
    assert!(store.get("never-created").await.unwrap().is_none());
    assert!(store.get_by_public_key("never-seen").await.unwrap().is_none());
    assert!(!store.delete("never-created").await.unwrap());
}

/// Races run from spawned tasks, so backends see real parallel callers
pub async fn run_concurrent(store: Arc<dyn RecordStore>) {
    racing_inserts_for_one_key(&store).await;
    racing_swaps_from_one_hash(&store).await;
}

async fn racing_inserts_for_one_key(store: &Arc<dyn RecordStore>) {
    for round in 0..ROUNDS {
        let public_key = format!("pk-insert-race-{}", round);
        let tasks: Vec<_> = (0..RACERS)
            .map(|i| {
                let store = Arc::clone(store);
                let draft = RecordDraft::new(public_key.clone(), format!("h{}", i));
                tokio::spawn(async move { store.insert_if_key_absent(draft).await.unwrap() })
            })
            .collect();

        let mut inserted = Vec::new();
        let mut existing = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                InsertOutcome::Inserted(record) => inserted.push(record),
                InsertOutcome::Existing(record) => existing.push(record),
            }
        }

        assert_eq!(inserted.len(), 1, "round {}: {:?}", round, inserted);
        let winner = &inserted[0];
        assert!(existing.iter().all(|record| record == winner));
        assert_eq!(
            store.get_by_public_key(&public_key).await.unwrap().as_ref(),
            Some(winner)
        );
    }
}

async fn racing_swaps_from_one_hash(store: &Arc<dyn RecordStore>) {
    for round in 0..ROUNDS {
        let record = store
            .put(RecordDraft::new(format!("pk-swap-race-{}", round), "h0"))
            .await
            .unwrap();

        let tasks: Vec<_> = (1..=RACERS)
            .map(|i| {
                let store = Arc::clone(store);
                let id = record.id.clone();
                tokio::spawn(async move {
                    store.swap_hash(&id, "h0", &format!("h{}", i)).await.unwrap()
                })
            })
            .collect();

        let mut swapped = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                SwapOutcome::Swapped(updated) => swapped.push(updated),
                SwapOutcome::Stale => {}
                SwapOutcome::Missing => panic!("record vanished during swap race"),
            }
        }

        assert_eq!(swapped.len(), 1, "round {}: {:?}", round, swapped);
        assert_eq!(
            store.get(&record.id).await.unwrap().unwrap().hash,
            swapped[0].hash
        );
    }
}
