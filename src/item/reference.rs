// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Lightweight handle over a shared message envelope.
//!
//! Several independent consumers (e.g. several durable subscriptions) may
//! each hold a reference to one envelope without duplicating the payload.
//! A reference carries its own listener slots — the same message fans out
//! to listeners per consumer — and its own independently releasable body
//! cache. The envelope is only removed from the store once its reference
//! count drops to zero, signalled through a dedicated event.

use crate::body::MessageBody;
use crate::error::Result;
use crate::events::{
    EventMessage, ListenerRef, ListenerSlots, MessageEvent, REFERENCE_SLOT_CAPACITIES,
};
use crate::item::envelope::MessageItem;
use crate::txn::Transaction;
use crate::types::{ItemId, Reliability, StorageStrategy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ItemReference {
    envelope: Arc<MessageItem>,
    slots: ListenerSlots,
    cached_body: Mutex<Option<Arc<MessageBody>>>,
    /// Caps this reference's storage strategy below the envelope's, for
    /// references that need not be as durable as the message they point to
    /// (non-durable subscription fan-out).
    downgrade: bool,
    released: AtomicBool,
}

impl ItemReference {
    pub fn new(envelope: &Arc<MessageItem>, downgrade: bool) -> Self {
        envelope.add_reference();
        if downgrade {
            envelope.add_non_persistent_ref();
        } else {
            envelope.add_persistent_ref();
        }
        ItemReference {
            envelope: Arc::clone(envelope),
            slots: ListenerSlots::new(REFERENCE_SLOT_CAPACITIES),
            cached_body: Mutex::new(None),
            downgrade,
            released: AtomicBool::new(false),
        }
    }

    pub fn envelope(&self) -> &Arc<MessageItem> {
        &self.envelope
    }

    // --- Forwarded read-only queries ---

    pub fn reliability(&self) -> Reliability {
        self.envelope.reliability()
    }

    pub fn priority(&self) -> u8 {
        self.envelope.priority()
    }

    pub fn aggregate_wait_time(&self) -> u64 {
        self.envelope.aggregate_wait_time()
    }

    pub fn max_time_in_store(&self) -> Option<u64> {
        self.envelope.max_time_in_store()
    }

    pub fn guess_redelivered_count(&self) -> u32 {
        self.envelope.guess_redelivered_count()
    }

    /// The envelope's strategy, capped at `Maybe` when downgraded.
    pub fn storage_strategy(&self) -> StorageStrategy {
        let strategy = self.envelope.storage_strategy();
        if self.downgrade {
            strategy.min(StorageStrategy::Maybe)
        } else {
            strategy
        }
    }

    /// The referenced body, cached per reference so each consumer can
    /// release it independently of the envelope's own cache.
    pub fn body(&self) -> Result<Arc<MessageBody>> {
        let mut cached = self.cached_body.lock();
        if let Some(body) = &*cached {
            return Ok(Arc::clone(body));
        }
        let body = self.envelope.body()?;
        *cached = Some(Arc::clone(&body));
        Ok(body)
    }

    /// Drop only this reference's cached body. Idempotent.
    pub fn release_body(&self) {
        *self.cached_body.lock() = None;
    }

    // --- Listener slots (distinct from the envelope's) ---

    pub fn register_listener(&self, event: MessageEvent, listener: &ListenerRef) -> Result<()> {
        self.slots.register(event, listener)
    }

    pub fn deregister_listener(&self, event: MessageEvent, listener: &ListenerRef) {
        self.slots.deregister(event, listener)
    }

    pub fn event_pre_commit_add(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::PreCommitAdd, self, Some(transaction))
    }

    pub fn event_pre_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::PreCommitRemove, self, Some(transaction))
    }

    pub fn event_post_commit_add(&self, transaction: &Transaction) -> Result<()> {
        if transaction.is_auto_commit() {
            return Ok(());
        }
        self.slots
            .dispatch_forward(MessageEvent::PostCommitAdd, self, Some(transaction))
    }

    pub fn event_post_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_reverse(MessageEvent::PostCommitRemove, self, Some(transaction))
    }

    pub fn event_post_rollback_add(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::PostRollbackAdd, self, Some(transaction))?;
        self.slots.clear_all();
        Ok(())
    }

    pub fn event_post_rollback_remove(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_reverse(MessageEvent::PostRollbackRemove, self, Some(transaction))
    }

    pub fn event_pre_unlocked(&self, transaction: Option<&Transaction>) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::PreUnlocked, self, transaction)
    }

    pub fn event_unlocked(&self) -> Result<()> {
        self.slots.dispatch_unlocked(self)
    }

    pub fn event_expiry_notification(&self, transaction: &Transaction) -> Result<()> {
        self.slots
            .dispatch_forward(MessageEvent::ExpiryNotification, self, Some(transaction))
    }

    /// Release this reference. When the envelope's count drops to zero its
    /// references-dropped-to-zero listener fires. Idempotent.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.release_body();
        self.envelope.drop_reference()
    }
}

impl Drop for ItemReference {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            if let Err(e) = self.release() {
                tracing::error!(error = %e, "reference release failed during drop");
            }
        }
    }
}

impl EventMessage for ItemReference {
    fn item_id(&self) -> Option<ItemId> {
        self.envelope.item_id()
    }

    fn reliability(&self) -> Reliability {
        self.envelope.reliability()
    }

    fn priority(&self) -> u8 {
        self.envelope.priority()
    }

    fn is_reference(&self) -> bool {
        true
    }
}
