// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Envelope lifecycle: persistence, hydration, storage strategy, wait-time
//! and redelivery accounting, reference fan-out.

use crate::error::StoreError;
use crate::events::{EventMessage, ListenerRef, MessageEvent, MessageEventListener};
use crate::item::{ItemReference, MessageItem};
use crate::record::Persistable;
use crate::store::{DurableStore, MemoryStore};
use crate::tests::sample_body;
use crate::txn::{Transaction, TransactionId};
use crate::types::{LockId, Reliability, StorageStrategy};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;

fn stored_item(reliability: Reliability) -> (Arc<dyn DurableStore>, MessageItem) {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let item = MessageItem::new(sample_body(reliability));
    let txn = Transaction::new(TransactionId(10));
    item.add_to_store(&store, &txn).unwrap();
    (store, item)
}

#[test]
fn release_and_rehydrate_is_idempotent() {
    let (_store, item) = stored_item(Reliability::AssuredPersistent);
    let before = item.body().unwrap();

    item.release_body();
    item.release_body();
    let after = item.body().unwrap();
    assert_eq!(*before, *after);
}

#[test]
fn best_effort_body_is_never_released() {
    let (_store, item) = stored_item(Reliability::BestEffortNonPersistent);
    // A best-effort message has no durable backing; releasing the cache
    // would lose the only copy.
    item.release_body();
    assert!(item.body().is_ok());
}

#[test]
fn mandatory_hydration_of_a_removed_item_fails() {
    let (store, item) = stored_item(Reliability::AssuredPersistent);
    item.release_body();
    let id = item.item_id().unwrap();
    store.remove(id, &Transaction::auto_commit()).unwrap();

    assert!(matches!(
        item.body(),
        Err(StoreError::BodyUnavailable(found)) if found == id
    ));
    // The lenient variant reports absence instead of failing.
    assert_eq!(item.body_if_available().unwrap(), None);
}

#[test]
fn storage_strategy_follows_reliability() {
    let cases = [
        (Reliability::BestEffortNonPersistent, StorageStrategy::Never),
        (Reliability::ExpressNonPersistent, StorageStrategy::Maybe),
        (Reliability::ReliableNonPersistent, StorageStrategy::Maybe),
        (Reliability::ReliablePersistent, StorageStrategy::Eventually),
        (Reliability::AssuredPersistent, StorageStrategy::Always),
    ];
    for (reliability, expected) in cases {
        let item = MessageItem::new(sample_body(reliability));
        assert_eq!(item.storage_strategy(), expected, "{reliability:?}");
    }
}

#[test]
fn non_durable_references_downgrade_to_maybe() {
    let item = MessageItem::new(sample_body(Reliability::AssuredPersistent));
    item.add_non_persistent_ref();
    assert_eq!(item.storage_strategy(), StorageStrategy::Maybe);

    // Any durable reference pins the reliability-derived tier for good.
    item.add_persistent_ref();
    assert_eq!(item.storage_strategy(), StorageStrategy::Always);
    item.add_non_persistent_ref();
    assert_eq!(item.storage_strategy(), StorageStrategy::Always);
}

#[test]
fn max_storage_strategy_caps_the_computed_tier() {
    let item = MessageItem::new(sample_body(Reliability::AssuredPersistent));
    // A temporary destination cannot store assured.
    item.set_max_storage_strategy(StorageStrategy::Maybe);
    assert_eq!(item.storage_strategy(), StorageStrategy::Maybe);
}

#[test]
fn downgraded_reference_caps_at_maybe() {
    let envelope = Arc::new(MessageItem::new(sample_body(Reliability::AssuredPersistent)));
    envelope.add_persistent_ref();
    let durable = ItemReference::new(&envelope, false);
    assert_eq!(durable.storage_strategy(), StorageStrategy::Always);

    let fanout = ItemReference::new(&envelope, true);
    assert_eq!(fanout.storage_strategy(), StorageStrategy::Maybe);
    // Forwarded queries come from the shared envelope.
    assert_eq!(fanout.reliability(), Reliability::AssuredPersistent);
    assert_eq!(fanout.priority(), 4);
}

#[test]
fn redelivery_count_grows_across_unlock_cycles() {
    let (store, item) = stored_item(Reliability::AssuredPersistent);
    let id = item.item_id().unwrap();

    let mut last = item.guess_redelivered_count();
    for _ in 0..3 {
        store.lock(id, LockId(50)).unwrap();
        item.unlock_message(LockId(50), None, true).unwrap();
        item.event_unlocked().unwrap();
        let count = item.guess_redelivered_count();
        assert!(count >= last);
        last = count;
    }
    assert_eq!(last, 3);
}

#[test]
fn redelivery_count_column_is_written_through_when_configured() {
    let (store, item) = stored_item(Reliability::AssuredPersistent);
    let id = item.item_id().unwrap();
    item.set_redelivery_count_persisted(true);

    store.lock(id, LockId(51)).unwrap();
    item.unlock_message(LockId(51), None, true).unwrap();
    assert_eq!(store.persisted_redelivered_count(id), 1);

    // A restored envelope folds the column into its guess.
    let restored = MessageItem::restore(&store, id, true).unwrap();
    assert_eq!(restored.guess_redelivered_count(), 2);
}

#[test]
fn redelivery_threshold_abandons_the_unlock() {
    struct Threshold {
        item: Arc<MessageItem>,
    }

    impl MessageEventListener for Threshold {
        fn message_event_occurred(
            &self,
            _event: MessageEvent,
            _message: &dyn EventMessage,
            _transaction: Option<&Transaction>,
        ) -> Result<()> {
            // Redirects the message instead of letting it unlock.
            self.item.set_redelivery_count_reached();
            Ok(())
        }
    }

    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let item = Arc::new(MessageItem::new(sample_body(Reliability::AssuredPersistent)));
    item.add_to_store(&store, &Transaction::new(TransactionId(11)))
        .unwrap();
    let id = item.item_id().unwrap();

    let listener: ListenerRef = Arc::new(Threshold {
        item: Arc::clone(&item),
    });
    item.register_listener(MessageEvent::PreUnlocked, &listener)
        .unwrap();

    store.lock(id, LockId(52)).unwrap();
    item.unlock_message(LockId(52), None, true).unwrap();
    // The pre-unlocked listener intercepted it; the lock still stands.
    assert_eq!(store.lock_id(id).unwrap(), Some(LockId(52)));
    assert_eq!(store.unlock_count(id), 0);
}

#[test]
fn wait_time_statistics_accumulate() {
    let item = MessageItem::new(sample_body(Reliability::ReliablePersistent));
    // sample_body: arrival at t0, 1s spent on the bus beforehand.
    let t0 = 1_700_000_000_000;
    assert_eq!(item.aggregate_wait_time(), 1_000);

    let aggregate = item.update_wait_time(t0 + 5_000);
    assert_eq!(aggregate, 6_000);
    assert_eq!(item.latest_wait_time_update(), 5_000);
    assert_eq!(item.aggregate_wait_time(), 6_000);
}

#[test]
fn max_time_in_store_subtracts_elapsed_wait() {
    let item = MessageItem::new(sample_body(Reliability::ReliablePersistent));
    // ttl 120s, 1s already spent.
    assert_eq!(item.max_time_in_store(), Some(119_000));

    let mut body = sample_body(Reliability::ReliablePersistent);
    body.time_to_live = 0;
    let immortal = MessageItem::new(body);
    assert_eq!(immortal.max_time_in_store(), None);
}

#[test]
fn record_roundtrip_restores_an_equal_envelope() {
    let (store, item) = stored_item(Reliability::AssuredPersistent);
    let id = item.item_id().unwrap();

    let restored = MessageItem::restore(&store, id, false).unwrap();
    assert_eq!(restored.reliability(), Reliability::AssuredPersistent);
    assert_eq!(restored.priority(), 4);
    assert_eq!(*restored.body().unwrap(), *item.body().unwrap());
    assert_eq!(restored.item_id(), Some(id));
}

#[test]
fn restore_of_an_unreadable_item_is_transient() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let missing = store.allocate_id();
    assert!(matches!(
        MessageItem::restore(&store, missing, false),
        Err(StoreError::NotAvailable(_))
    ));
}

#[test]
fn pending_metadata_is_folded_in_at_encode_time() {
    let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
    let item = MessageItem::new(sample_body(Reliability::AssuredPersistent));
    item.set_current_arrival_timestamp(42);
    item.set_connection_id(None);
    item.add_to_store(&store, &Transaction::new(TransactionId(12)))
        .unwrap();

    let restored = MessageItem::restore(&store, item.item_id().unwrap(), false).unwrap();
    let body = restored.body().unwrap();
    assert_eq!(body.arrival_timestamp, 42);
    assert_eq!(body.connection_id, None);
}

#[test]
fn references_dropped_to_zero_fires_once() {
    struct Zero {
        log: Arc<Mutex<u32>>,
    }

    impl MessageEventListener for Zero {
        fn message_event_occurred(
            &self,
            _event: MessageEvent,
            _message: &dyn EventMessage,
            _transaction: Option<&Transaction>,
        ) -> Result<()> {
            *self.log.lock() += 1;
            Ok(())
        }
    }

    let envelope = Arc::new(MessageItem::new(sample_body(Reliability::AssuredPersistent)));
    let log = Arc::new(Mutex::new(0));
    let listener: ListenerRef = Arc::new(Zero {
        log: Arc::clone(&log),
    });
    envelope
        .register_listener(MessageEvent::ReferencesDroppedToZero, &listener)
        .unwrap();

    let first = ItemReference::new(&envelope, false);
    let second = ItemReference::new(&envelope, true);
    assert_eq!(envelope.reference_count(), 2);

    first.release().unwrap();
    assert_eq!(*log.lock(), 0);
    second.release().unwrap();
    assert_eq!(*log.lock(), 1);
    // Releasing again changes nothing.
    second.release().unwrap();
    assert_eq!(*log.lock(), 1);
}

#[test]
fn reference_body_cache_is_independent() {
    let (_store, item) = stored_item(Reliability::AssuredPersistent);
    let envelope = Arc::new(item);
    let reference = ItemReference::new(&envelope, false);

    let via_reference = reference.body().unwrap();
    envelope.release_body();
    // The reference still serves from its own cache.
    let again = reference.body().unwrap();
    assert_eq!(*via_reference, *again);

    reference.release_body();
    assert_eq!(*reference.body().unwrap(), *via_reference);
}

#[test]
fn message_item_record_rejects_wrong_version() {
    let item = MessageItem::new(sample_body(Reliability::AssuredPersistent));
    let payload = {
        let framed = item.persistent_data().unwrap();
        let (_, payload) = crate::record::decode_frame(&framed).unwrap();
        payload.to_vec()
    };
    let reframed = crate::record::encode_frame(7, &payload).unwrap();
    assert!(matches!(
        <MessageItem as Persistable>::decode(&reframed),
        Err(StoreError::SchemaVersionMismatch { expected: 1, found: 7 })
    ));
}
