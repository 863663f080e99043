// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Message envelope: one logical message as held by the store.
//!
//! Wraps an immutable body with the mutable store-side metadata the engine
//! needs (reliability-derived storage strategy, wait-time statistics,
//! redelivery accounting, listener slots). The body is materialised lazily:
//! once the durable representation is stable the in-memory copy may be
//! released and later reconstituted from the log.
//!
//! State machine per envelope:
//! `Created -> Persisted? -> Locked <-> Unlocked -> (Committed-Remove |
//! Rolled-Back-Remove) -> Destroyed`, driven exclusively by
//! transaction-outcome callbacks.

use crate::body::MessageBody;
use crate::error::{Result, StoreError};
use crate::events::{
    EventMessage, ListenerRef, ListenerSlots, MessageEvent, ENVELOPE_SLOT_CAPACITIES,
};
use crate::record::{decode_frame, encode_frame, require_version, Persistable};
use crate::store::DurableStore;
use crate::txn::{Transaction, TransactionCallback};
use crate::types::{
    ConnectionId, ItemId, LockId, MaintainPersistence, Reliability, StorageStrategy,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Body cache plus the metadata that must change atomically with it.
///
/// The connection id and arrival timestamp are written into the body lazily
/// at encode time; one mutual-exclusion domain covers the cache and those
/// pending writes so a concurrent encode never observes half an update.
struct BodyState {
    cached: Option<Arc<MessageBody>>,
    pending_arrival: Option<u64>,
    pending_connection: Option<Option<ConnectionId>>,
}

struct StoreBinding {
    store: Arc<dyn DurableStore>,
    id: ItemId,
}

#[derive(Debug, Default)]
struct WaitTimes {
    /// Arrival timestamp at this engine, ms since epoch.
    arrival: u64,
    /// Time spent in the bus before reaching this engine.
    pre_arrival: u64,
    /// Aggregate wait including this engine, refreshed by
    /// [`MessageItem::update_wait_time`].
    aggregate: u64,
    /// The latest measured period spent on this engine.
    latest_update: u64,
}

pub struct MessageItem {
    body: Mutex<BodyState>,
    slots: ListenerSlots,
    binding: Mutex<Option<StoreBinding>>,
    reliability: Reliability,
    priority: u8,
    time_to_live: u64,
    report_expiry: bool,
    max_storage_strategy: Mutex<StorageStrategy>,
    maintain_persistence: Mutex<MaintainPersistence>,
    wait: Mutex<WaitTimes>,
    hidden: AtomicBool,
    reserved: AtomicBool,
    reavailable: AtomicBool,
    deferred_init: AtomicBool,
    redelivery_count_reached: AtomicBool,
    /// Destination configuration: persist the redelivery count column.
    redelivery_count_persisted: AtomicBool,
    /// Redelivery count column value as read at restore.
    persisted_base: AtomicU32,
    /// Remote unlock count already merged at an unlock boundary.
    remote_unlocks: AtomicU32,
    /// Remote unlocks reported but not yet merged.
    uncommitted_remote_unlocks: AtomicU32,
    references: AtomicUsize,
}

impl MessageItem {
    pub fn new(body: MessageBody) -> Self {
        let reliability = body.reliability;
        let priority = body.priority;
        let time_to_live = body.time_to_live;
        let report_expiry = body.report_expiry;
        let wait = WaitTimes {
            arrival: body.arrival_timestamp,
            pre_arrival: body.wait_time,
            aggregate: body.wait_time,
            latest_update: 0,
        };
        MessageItem {
            body: Mutex::new(BodyState {
                cached: Some(Arc::new(body)),
                pending_arrival: None,
                pending_connection: None,
            }),
            slots: ListenerSlots::new(ENVELOPE_SLOT_CAPACITIES),
            binding: Mutex::new(None),
            reliability,
            priority,
            time_to_live,
            report_expiry,
            max_storage_strategy: Mutex::new(StorageStrategy::Always),
            maintain_persistence: Mutex::new(MaintainPersistence::Unknown),
            wait: Mutex::new(wait),
            hidden: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            reavailable: AtomicBool::new(false),
            deferred_init: AtomicBool::new(false),
            redelivery_count_reached: AtomicBool::new(false),
            redelivery_count_persisted: AtomicBool::new(false),
            persisted_base: AtomicU32::new(0),
            remote_unlocks: AtomicU32::new(0),
            uncommitted_remote_unlocks: AtomicU32::new(0),
            references: AtomicUsize::new(0),
        }
    }

    /// Persist this envelope into the store under a fresh id.
    pub fn add_to_store(
        &self,
        store: &Arc<dyn DurableStore>,
        transaction: &Transaction,
    ) -> Result<ItemId> {
        let id = store.allocate_id();
        let data = self.persistent_data()?;
        store.add(id, self.storage_strategy(), &data, transaction)?;
        *self.binding.lock() = Some(StoreBinding {
            store: Arc::clone(store),
            id,
        });
        Ok(id)
    }

    /// Rebuild an envelope from its persisted representation.
    ///
    /// Fails with [`StoreError::NotAvailable`] when the item is not readable
    /// yet (e.g. held by an in-doubt transaction at restart); callers should
    /// defer and retry from a later callback.
    pub fn restore(
        store: &Arc<dyn DurableStore>,
        id: ItemId,
        persist_redelivery_count: bool,
    ) -> Result<Self> {
        let bytes = store.read(id)?.ok_or_else(|| {
            StoreError::NotAvailable(format!("{id} not readable during restore"))
        })?;
        let item = <MessageItem as Persistable>::decode(&bytes)?;
        item.redelivery_count_persisted
            .store(persist_redelivery_count, Ordering::SeqCst);
        if persist_redelivery_count {
            item.persisted_base
                .store(store.persisted_redelivered_count(id), Ordering::SeqCst);
        }
        *item.binding.lock() = Some(StoreBinding {
            store: Arc::clone(store),
            id,
        });
        Ok(item)
    }

    pub fn item_id(&self) -> Option<ItemId> {
        self.binding.lock().as_ref().map(|binding| binding.id)
    }

    pub(crate) fn bind(&self, store: &Arc<dyn DurableStore>, id: ItemId) {
        *self.binding.lock() = Some(StoreBinding {
            store: Arc::clone(store),
            id,
        });
    }

    fn bound_store(&self) -> Option<(Arc<dyn DurableStore>, ItemId)> {
        self.binding
            .lock()
            .as_ref()
            .map(|binding| (Arc::clone(&binding.store), binding.id))
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// The message body, materialising it from the durable log if the
    /// in-memory copy was released. Only one hydration runs per envelope
    /// even under contention.
    pub fn body(&self) -> Result<Arc<MessageBody>> {
        match self.body_internal(true)? {
            Some(body) => Ok(body),
            None => Err(StoreError::Internal(
                "mandatory body hydration returned nothing".to_string(),
            )),
        }
    }

    /// As [`MessageItem::body`], but returns `None` instead of failing when
    /// the underlying record cannot be found.
    pub fn body_if_available(&self) -> Result<Option<Arc<MessageBody>>> {
        self.body_internal(false)
    }

    fn body_internal(&self, required: bool) -> Result<Option<Arc<MessageBody>>> {
        let mut state = self.body.lock();
        if let Some(body) = &state.cached {
            return Ok(Some(Arc::clone(body)));
        }
        let Some((store, id)) = self.bound_store() else {
            return if required {
                Err(StoreError::Internal(
                    "released body with no store binding".to_string(),
                ))
            } else {
                Ok(None)
            };
        };
        match store.read(id)? {
            Some(bytes) => {
                let body = Arc::new(decode_body_frame(&bytes)?);
                state.cached = Some(Arc::clone(&body));
                Ok(Some(body))
            }
            None if required => Err(StoreError::BodyUnavailable(id)),
            None => Ok(None),
        }
    }

    /// Discard the in-memory body once the durable representation is
    /// stable. A best-effort non-persistent message has no durable backing,
    /// so its only copy is never discarded. Idempotent.
    pub fn release_body(&self) {
        if self.reliability > Reliability::BestEffortNonPersistent && self.is_persisted() {
            self.body.lock().cached = None;
        }
    }

    /// Whether the store currently holds a durable representation.
    pub fn is_persisted(&self) -> bool {
        match self.bound_store() {
            Some((store, id)) => store.contains(id),
            None => false,
        }
    }

    /// The stable byte representation handed to the durable log. Pending
    /// metadata (arrival timestamp, connection id) is folded into the body
    /// under the same guard that protects concurrent encodes; on encode
    /// failure the envelope is left unmodified.
    pub fn persistent_data(&self) -> Result<Vec<u8>> {
        let mut state = self.body.lock();
        let Some(current) = &state.cached else {
            let id = self.item_id().unwrap_or(ItemId(0));
            return Err(StoreError::BodyUnavailable(id));
        };
        let mut body = (**current).clone();
        if let Some(arrival) = state.pending_arrival {
            body.arrival_timestamp = arrival;
        }
        if let Some(connection) = state.pending_connection {
            body.connection_id = connection;
        }
        let payload = body.encode()?;
        let framed = encode_frame(<MessageItem as Persistable>::CURRENT_VERSION, &payload)?;
        state.cached = Some(Arc::new(body));
        state.pending_arrival = None;
        state.pending_connection = None;
        Ok(framed)
    }

    /// Durability tier, computed from reliability and the reference
    /// persistence tri-state, capped by the maximum the destination allows
    /// (e.g. a temporary destination cannot store assured).
    pub fn storage_strategy(&self) -> StorageStrategy {
        let maintain = *self.maintain_persistence.lock();
        let strategy = if self.reliability == Reliability::BestEffortNonPersistent {
            StorageStrategy::Never
        } else if maintain != MaintainPersistence::NonDurableOnly
            && self.reliability == Reliability::ReliablePersistent
        {
            StorageStrategy::Eventually
        } else if maintain != MaintainPersistence::NonDurableOnly
            && self.reliability == Reliability::AssuredPersistent
        {
            StorageStrategy::Always
        } else {
            StorageStrategy::Maybe
        };
        strategy.min(*self.max_storage_strategy.lock())
    }

    pub fn set_max_storage_strategy(&self, cap: StorageStrategy) {
        *self.max_storage_strategy.lock() = cap;
    }

    /// Note a durable reference: the message must keep its persistence.
    pub fn add_persistent_ref(&self) {
        *self.maintain_persistence.lock() = MaintainPersistence::Durable;
    }

    /// Note a non-durable reference. Only downgrades when no durable
    /// reference was ever seen.
    pub fn add_non_persistent_ref(&self) {
        let mut maintain = self.maintain_persistence.lock();
        if *maintain == MaintainPersistence::Unknown {
            *maintain = MaintainPersistence::NonDurableOnly;
        }
    }

    pub fn register_listener(&self, event: MessageEvent, listener: &ListenerRef) -> Result<()> {
        self.slots.register(event, listener)
    }

    pub fn deregister_listener(&self, event: MessageEvent, listener: &ListenerRef) {
        self.slots.deregister(event, listener)
    }

    /// Restore may have completed without the engine being ready; record
    /// that and retry from the next event callback.
    pub fn mark_deferred_init(&self) {
        self.deferred_init.store(true, Ordering::SeqCst);
    }

    fn ensure_initialised(&self) -> Result<()> {
        if !self.deferred_init.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.body_if_available() {
            Ok(Some(_)) => {
                self.deferred_init.store(false, Ordering::SeqCst);
                Ok(())
            }
            Ok(None) | Err(StoreError::NotAvailable(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    // --- Transactional event entry points ---

    pub fn event_pre_commit_add(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        self.slots
            .dispatch_forward(MessageEvent::PreCommitAdd, self, Some(transaction))
    }

    pub fn event_pre_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        self.slots
            .dispatch_forward(MessageEvent::PreCommitRemove, self, Some(transaction))
    }

    /// Listeners are not driven for auto-commit transactions; the add was
    /// never in doubt.
    pub fn event_post_commit_add(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        if transaction.is_auto_commit() {
            return Ok(());
        }
        self.slots
            .dispatch_forward(MessageEvent::PostCommitAdd, self, Some(transaction))
    }

    pub fn event_post_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        self.slots
            .dispatch_reverse(MessageEvent::PostCommitRemove, self, Some(transaction))
    }

    pub fn event_post_rollback_add(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        self.slots
            .dispatch_forward(MessageEvent::PostRollbackAdd, self, Some(transaction))?;
        // The add never happened; nothing will ever fire again.
        self.slots.clear_all();
        Ok(())
    }

    pub fn event_post_rollback_remove(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        self.slots
            .dispatch_reverse(MessageEvent::PostRollbackRemove, self, Some(transaction))
    }

    pub fn event_unlocked(&self) -> Result<()> {
        self.ensure_initialised()?;
        self.reavailable.store(true, Ordering::SeqCst);
        self.slots.dispatch_unlocked(self)?;
        self.reavailable.store(false, Ordering::SeqCst);
        let uncommitted = self.uncommitted_remote_unlocks.swap(0, Ordering::SeqCst);
        self.remote_unlocks.fetch_add(uncommitted, Ordering::SeqCst);
        Ok(())
    }

    pub fn event_locked(&self) {
        // Nothing to do for a locally produced message.
    }

    pub fn event_references_dropped_to_zero(&self) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::ReferencesDroppedToZero, self, None)
    }

    pub fn event_expiry_notification(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        if self.report_expiry {
            self.slots
                .dispatch_forward(MessageEvent::ExpiryNotification, self, Some(transaction))?;
        }
        Ok(())
    }

    /// Unlock the message, driving pre-unlocked listeners first. A listener
    /// may redirect the message (redelivery threshold reached), in which
    /// case the unlock is abandoned. All unlocking goes through here.
    pub fn unlock_message(
        &self,
        lock: LockId,
        transaction: Option<&Transaction>,
        increment: bool,
    ) -> Result<()> {
        self.ensure_initialised()?;
        if increment {
            self.redelivery_count_reached.store(false, Ordering::SeqCst);
            if let Err(e) = self
                .slots
                .dispatch_forward(MessageEvent::PreUnlocked, self, transaction)
            {
                tracing::error!(error = %e, "pre-unlocked listener failed; unlocking anyway");
                self.redelivery_count_reached.store(false, Ordering::SeqCst);
            }
        }
        if self.redelivery_count_reached.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (store, id) = self
            .bound_store()
            .ok_or_else(|| StoreError::Internal("unlock with no store binding".to_string()))?;
        store.unlock(id, lock, increment)?;
        if self.redelivery_count_persisted.load(Ordering::SeqCst)
            && store.supports_redelivery_column()
        {
            let count = self.guess_redelivered_count();
            store.persist_redelivered_count(id, count)?;
            let mut state = self.body.lock();
            if let Some(current) = &state.cached {
                let mut body = (**current).clone();
                body.redelivered_count = count;
                state.cached = Some(Arc::new(body));
            }
        }
        Ok(())
    }

    /// Advisory redelivery count: the store's unlock counter, remote unlock
    /// counts (merged and pending), and the persisted column as read at
    /// restore. A guess, because a durable counter write per unlock is
    /// deliberately avoided; slight undercounting across crashes is
    /// accepted.
    pub fn guess_redelivered_count(&self) -> u32 {
        let store_count = match self.bound_store() {
            Some((store, id)) => store.unlock_count(id),
            None => 0,
        };
        store_count
            + self.remote_unlocks.load(Ordering::SeqCst)
            + self.uncommitted_remote_unlocks.load(Ordering::SeqCst)
            + self.persisted_base.load(Ordering::SeqCst)
    }

    /// A remote engine reported an unlock that its transaction has not yet
    /// committed; merged into the committed count at the next unlock.
    pub fn record_uncommitted_remote_unlock(&self) {
        self.uncommitted_remote_unlocks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_redelivery_count_reached(&self) {
        self.redelivery_count_reached.store(true, Ordering::SeqCst);
    }

    pub fn set_redelivery_count_persisted(&self, persisted: bool) {
        self.redelivery_count_persisted
            .store(persisted, Ordering::SeqCst);
    }

    /// Remaining time this message may spend in the store; `None` when it
    /// never expires.
    pub fn max_time_in_store(&self) -> Option<u64> {
        if self.time_to_live == 0 {
            return None;
        }
        Some(
            self.time_to_live
                .saturating_sub(self.wait.lock().aggregate),
        )
    }

    /// Refresh the wait-time statistics against `now_ms` and return the new
    /// aggregate.
    pub fn update_wait_time(&self, now_ms: u64) -> u64 {
        let mut wait = self.wait.lock();
        wait.latest_update = now_ms.saturating_sub(wait.arrival);
        wait.aggregate = wait.latest_update + wait.pre_arrival;
        wait.aggregate
    }

    pub fn aggregate_wait_time(&self) -> u64 {
        self.wait.lock().aggregate
    }

    pub fn latest_wait_time_update(&self) -> u64 {
        self.wait.lock().latest_update
    }

    pub fn set_current_arrival_timestamp(&self, timestamp: u64) {
        let mut state = self.body.lock();
        state.pending_arrival = Some(timestamp);
        drop(state);
        self.wait.lock().arrival = timestamp;
    }

    /// Stage the producing connection id for the next encode. Shares the
    /// body guard because the id is serialized together with the body.
    pub fn set_connection_id(&self, connection: Option<ConnectionId>) {
        self.body.lock().pending_connection = Some(connection);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn set_reserved(&self, reserved: bool) {
        self.reserved.store(reserved, Ordering::SeqCst);
    }

    /// True only while unlocked listeners are being driven.
    pub fn is_reavailable(&self) -> bool {
        self.reavailable.load(Ordering::SeqCst)
    }

    // --- Reference counting ---

    pub(crate) fn add_reference(&self) {
        self.references.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn drop_reference(&self) -> Result<()> {
        let previous = self.references.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            self.event_references_dropped_to_zero()?;
        }
        Ok(())
    }

    pub fn reference_count(&self) -> usize {
        self.references.load(Ordering::SeqCst)
    }
}

/// Rehydration reads the body from the front of whatever record was
/// spilled; composite records (remote-get specialisations) append their own
/// fields after it.
fn decode_body_frame(bytes: &[u8]) -> Result<MessageBody> {
    let (version, payload) = decode_frame(bytes)?;
    require_version(<MessageItem as Persistable>::CURRENT_VERSION, version)?;
    let (body, _) = MessageBody::decode_prefix(payload)?;
    Ok(body)
}

impl Persistable for MessageItem {
    const CURRENT_VERSION: u16 = 1;

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        // Reuses the guarded encode so pending metadata is applied.
        let framed = self.persistent_data()?;
        let (_, payload) = decode_frame(&framed)?;
        buf.extend_from_slice(payload);
        Ok(())
    }

    fn decode_payload(version: u16, payload: &[u8]) -> Result<Self> {
        require_version(Self::CURRENT_VERSION, version)?;
        let body = MessageBody::decode(payload)?;
        Ok(MessageItem::new(body))
    }
}

impl EventMessage for MessageItem {
    fn item_id(&self) -> Option<ItemId> {
        self.binding.lock().as_ref().map(|binding| binding.id)
    }

    fn reliability(&self) -> Reliability {
        self.reliability
    }

    fn priority(&self) -> u8 {
        self.priority
    }
}

impl TransactionCallback for MessageItem {
    fn before_completion(&self, transaction: &Transaction) -> Result<()> {
        self.ensure_initialised()?;
        // One-shot: the pre-prepare listener is cleared on first delivery.
        if let Some(listener) = self.slots.take(MessageEvent::PrePrepare) {
            listener.message_event_occurred(MessageEvent::PrePrepare, self, Some(transaction))?;
        }
        Ok(())
    }

    fn after_completion(&self, transaction: &Transaction, committed: bool) {
        if let Err(e) = self.ensure_initialised() {
            tracing::error!(error = %e, "deferred initialisation failed after completion");
            return;
        }
        if committed {
            if let Some(listener) = self.slots.take(MessageEvent::PostCommittedTransaction) {
                if let Err(e) = listener.message_event_occurred(
                    MessageEvent::PostCommittedTransaction,
                    self,
                    Some(transaction),
                ) {
                    tracing::error!(error = %e, "post-committed-transaction listener failed");
                }
            }
        }
        // The outcome is durable; the in-memory body can go.
        self.release_body();
    }
}
