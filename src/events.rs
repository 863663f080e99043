// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Transactional event kinds and the fixed-capacity listener slot table.
//!
//! Each event kind has a small fixed number of slots; at most that many
//! components may ever observe the event on one item. Registration claims
//! the lowest free slot, so dispatch order is registration order. Two
//! orders are deliberate and load-bearing:
//!
//! - add events dispatch in slot order (1, 2);
//! - remove events dispatch in reverse slot order (5..1), stack-like, so a
//!   consumer registered after the dispatcher is driven before it;
//! - the unlocked event runs two passes: every non-primary listener first,
//!   then the primary dispatcher, so a consumer that registers itself
//!   during the first pass is not redelivered to within the same unlock
//!   cycle.

use crate::error::{Result, StoreError};
use crate::txn::Transaction;
use crate::types::{ItemId, Reliability};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageEvent {
    PreCommitAdd,
    PreCommitRemove,
    PostCommitAdd,
    PostCommitRemove,
    PostRollbackAdd,
    PostRollbackRemove,
    Locked,
    PreUnlocked,
    Unlocked,
    ReferencesDroppedToZero,
    PrePrepare,
    PostCommittedTransaction,
    ExpiryNotification,
}

/// Slot capacities for a message envelope.
pub const ENVELOPE_SLOT_CAPACITIES: &[(MessageEvent, usize)] = &[
    (MessageEvent::PreCommitAdd, 1),
    (MessageEvent::PreCommitRemove, 1),
    (MessageEvent::PostCommitAdd, 2),
    (MessageEvent::PostCommitRemove, 5),
    (MessageEvent::PostRollbackAdd, 2),
    (MessageEvent::PostRollbackRemove, 5),
    (MessageEvent::PreUnlocked, 2),
    (MessageEvent::Unlocked, 3),
    (MessageEvent::ReferencesDroppedToZero, 1),
    (MessageEvent::PrePrepare, 1),
    (MessageEvent::PostCommittedTransaction, 1),
    (MessageEvent::ExpiryNotification, 1),
];

/// Slot capacities for an item reference. Sized for the maximum expected
/// fan-out: dispatcher, stream and an optional local consumer, doubled on
/// the remove path for failure replay.
pub const REFERENCE_SLOT_CAPACITIES: &[(MessageEvent, usize)] = &[
    (MessageEvent::PreCommitAdd, 1),
    (MessageEvent::PreCommitRemove, 1),
    (MessageEvent::PostCommitAdd, 2),
    (MessageEvent::PostCommitRemove, 5),
    (MessageEvent::PostRollbackAdd, 2),
    (MessageEvent::PostRollbackRemove, 5),
    (MessageEvent::PreUnlocked, 2),
    (MessageEvent::Unlocked, 4),
    (MessageEvent::ExpiryNotification, 1),
];

/// Read-only view of the item an event fired on.
pub trait EventMessage: Send + Sync {
    fn item_id(&self) -> Option<ItemId>;
    fn reliability(&self) -> Reliability;
    fn priority(&self) -> u8;
    fn is_reference(&self) -> bool {
        false
    }
}

pub trait MessageEventListener: Send + Sync {
    fn message_event_occurred(
        &self,
        event: MessageEvent,
        message: &dyn EventMessage,
        transaction: Option<&Transaction>,
    ) -> Result<()>;

    /// The primary consumer dispatcher is always driven last on unlock.
    fn is_primary_dispatcher(&self) -> bool {
        false
    }
}

pub type ListenerRef = Arc<dyn MessageEventListener>;

pub struct ListenerSlots {
    capacities: &'static [(MessageEvent, usize)],
    table: RwLock<FxHashMap<MessageEvent, Vec<Option<ListenerRef>>>>,
}

impl ListenerSlots {
    pub fn new(capacities: &'static [(MessageEvent, usize)]) -> Self {
        ListenerSlots {
            capacities,
            table: RwLock::new(FxHashMap::default()),
        }
    }

    fn capacity(&self, event: MessageEvent) -> usize {
        self.capacities
            .iter()
            .find(|(kind, _)| *kind == event)
            .map(|(_, cap)| *cap)
            .unwrap_or(0)
    }

    /// Claim the lowest free slot for `event`. Exhaustion is an invariant
    /// violation, not a routine condition.
    pub fn register(&self, event: MessageEvent, listener: &ListenerRef) -> Result<()> {
        let capacity = self.capacity(event);
        let mut table = self.table.write();
        let slots = table.entry(event).or_insert_with(|| vec![None; capacity]);
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Arc::clone(listener));
                return Ok(());
            }
        }
        tracing::error!(?event, "listener slots exhausted");
        Err(StoreError::SlotsExhausted(event))
    }

    /// Idempotent removal; no-op when the listener is not registered.
    pub fn deregister(&self, event: MessageEvent, listener: &ListenerRef) {
        let mut table = self.table.write();
        if let Some(slots) = table.get_mut(&event) {
            for slot in slots.iter_mut() {
                if slot
                    .as_ref()
                    .is_some_and(|registered| Arc::ptr_eq(registered, listener))
                {
                    *slot = None;
                    return;
                }
            }
        }
    }

    /// Drop every registration. Used after a rolled-back add, when the item
    /// will never be seen again.
    pub fn clear_all(&self) {
        self.table.write().clear();
    }

    /// Remove and return the single listener for a one-shot event.
    pub fn take(&self, event: MessageEvent) -> Option<ListenerRef> {
        let mut table = self.table.write();
        let slots = table.get_mut(&event)?;
        slots.iter_mut().find_map(|slot| slot.take())
    }

    fn snapshot(&self, event: MessageEvent) -> Vec<ListenerRef> {
        let table = self.table.read();
        match table.get(&event) {
            Some(slots) => slots.iter().flatten().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn is_registered(&self, event: MessageEvent, listener: &ListenerRef) -> bool {
        let table = self.table.read();
        table.get(&event).is_some_and(|slots| {
            slots
                .iter()
                .flatten()
                .any(|registered| Arc::ptr_eq(registered, listener))
        })
    }

    /// Dispatch in slot order. Listeners that deregistered themselves since
    /// the snapshot are skipped; the lock is never held across a callback.
    pub fn dispatch_forward(
        &self,
        event: MessageEvent,
        message: &dyn EventMessage,
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        for listener in self.snapshot(event) {
            if self.is_registered(event, &listener) {
                listener.message_event_occurred(event, message, transaction)?;
            }
        }
        Ok(())
    }

    /// Dispatch in reverse slot order (highest occupied slot first).
    pub fn dispatch_reverse(
        &self,
        event: MessageEvent,
        message: &dyn EventMessage,
        transaction: Option<&Transaction>,
    ) -> Result<()> {
        for listener in self.snapshot(event).into_iter().rev() {
            if self.is_registered(event, &listener) {
                listener.message_event_occurred(event, message, transaction)?;
            }
        }
        Ok(())
    }

    /// Two-pass unlocked dispatch: non-primary listeners first, then the
    /// primary dispatcher. Each pass takes a fresh snapshot, so a consumer
    /// registered during the first pass is only ever seen by the second,
    /// which skips non-primary listeners.
    pub fn dispatch_unlocked(&self, message: &dyn EventMessage) -> Result<()> {
        for pass in 0..2 {
            for listener in self.snapshot(MessageEvent::Unlocked) {
                let primary = listener.is_primary_dispatcher();
                if (pass == 0 && !primary) || (pass == 1 && primary) {
                    if self.is_registered(MessageEvent::Unlocked, &listener) {
                        listener.message_event_occurred(
                            MessageEvent::Unlocked,
                            message,
                            None,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }
}
