// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Requester-side envelope for a message obtained via remote get.
//!
//! The supplier is authoritative for the message, so the requester never
//! has to persist it — storage strategy is capped at `Maybe`, though the
//! body may still spill under memory pressure. What the requester must get
//! right is the decision routing: "accept" is signalled at pre-commit
//! (irrevocable intent, letting the supplier free resources
//! optimistically), while "committed"/"rolled back" are signalled at
//! post-commit once the outcome is durable. Expiry on the requester turns
//! into a reject by remembering the expiring transaction.

use crate::body::MessageBody;
use crate::error::{Result, StoreError};
use crate::item::envelope::MessageItem;
use crate::anycast::value::ValueTick;
use crate::record::{decode_frame, require_version, Persistable};
use crate::store::DurableStore;
use crate::txn::{Transaction, TransactionId};
use crate::types::{ItemId, LockId, Reliability, StorageStrategy, Tick};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-tick handshake signals back to the anycast input handler.
pub trait AnycastResponder: Send + Sync {
    /// Irrevocable intent to consume, decided at pre-commit.
    fn accept(&self, tick: Tick);
    /// The removing transaction committed durably.
    fn committed(&self, tick: Tick);
    /// The tick was rejected or rolled back; the handler may drain any
    /// pending flush work as a side effect.
    fn rolled_back(&self, tick: Tick);
}

/// Prefetch/flow-control accounting on the remote consumer key.
pub trait RemoteDispatchKey: Send + Sync {
    fn message_locked(&self, tick: Tick);
    fn message_unlocked(&self, tick: Tick);
}

pub struct RemoteMessage {
    envelope: Arc<MessageItem>,
    tick: Tick,
    /// The supplier rejects the message back no later than this, so the
    /// requester's expiry is clamped to it.
    reject_timeout_ms: u64,
    responder: Mutex<Option<Arc<dyn AnycastResponder>>>,
    dispatch_key: Mutex<Option<Arc<dyn RemoteDispatchKey>>>,
    /// Whether the dispatch key's prefetch counter has been told the
    /// message is locked. Persisted, so a spill/restore cycle does not
    /// double count.
    informed_key_locked: AtomicBool,
    /// The transaction rejecting this message, if any; routes the
    /// accept-vs-reject decision at completion time.
    reject_txn: Mutex<Option<TransactionId>>,
    /// The value tick a restored message must be matched to. Cleared after
    /// the binding attempt, whatever the outcome, so the value record can
    /// be collected independently.
    bound_value: Mutex<Option<Arc<ValueTick>>>,
}

impl RemoteMessage {
    pub fn new(body: MessageBody, tick: Tick, reject_timeout_ms: u64) -> Self {
        let envelope = MessageItem::new(body);
        envelope.set_max_storage_strategy(StorageStrategy::Maybe);
        RemoteMessage {
            envelope: Arc::new(envelope),
            tick,
            reject_timeout_ms,
            responder: Mutex::new(None),
            dispatch_key: Mutex::new(None),
            informed_key_locked: AtomicBool::new(false),
            reject_txn: Mutex::new(None),
            bound_value: Mutex::new(None),
        }
    }

    pub fn envelope(&self) -> &Arc<MessageItem> {
        &self.envelope
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn reliability(&self) -> Reliability {
        self.envelope.reliability()
    }

    pub fn storage_strategy(&self) -> StorageStrategy {
        self.envelope.storage_strategy()
    }

    pub fn set_responder(&self, responder: Arc<dyn AnycastResponder>) {
        *self.responder.lock() = Some(responder);
    }

    pub fn set_dispatch_key(&self, key: Arc<dyn RemoteDispatchKey>) {
        *self.dispatch_key.lock() = Some(key);
    }

    pub fn reject_transaction_id(&self) -> Option<TransactionId> {
        *self.reject_txn.lock()
    }

    pub fn is_reserved(&self) -> bool {
        self.envelope.is_reserved()
    }

    /// Bind this message to the value tick it was delivered for. The
    /// message is reserved from here on, preventing delivery to any other
    /// consumer until the binding resolves.
    pub fn reserve(&self, value: &Arc<ValueTick>) {
        *self.bound_value.lock() = Some(Arc::clone(value));
        self.envelope.set_reserved(true);
    }

    /// Complete the binding of a previously-unrestored message to its
    /// pending value tick.
    ///
    /// If the value is flushing, the handshake was abandoned: the
    /// reservation is dropped and the message is left to ordinary expiry
    /// or redelivery. Otherwise the message is locked to the value under a
    /// fresh auto-commit transaction and the lock persisted; any failure
    /// there indicates storage corruption and is fatal. The binding
    /// reference is released regardless of outcome.
    pub fn bind_restored_value(&self, store: &Arc<dyn DurableStore>) -> Result<()> {
        let Some(value) = self.bound_value.lock().take() else {
            return Ok(());
        };
        if value.is_flushing() {
            self.envelope.set_reserved(false);
            tracing::debug!(tick = %self.tick, "value flushing; binding abandoned");
            return Ok(());
        }
        let outcome = self.lock_to_value(store, &value);
        if let Err(e) = outcome {
            self.envelope.set_reserved(false);
            return Err(StoreError::Internal(format!(
                "binding of {} failed: {e}",
                self.tick
            )));
        }
        Ok(())
    }

    fn lock_to_value(&self, store: &Arc<dyn DurableStore>, value: &ValueTick) -> Result<()> {
        let item = self
            .envelope
            .item_id()
            .ok_or_else(|| StoreError::Internal("binding before store add".to_string()))?;
        let transaction = Transaction::auto_commit();
        let lock = value.persistent_lock().unwrap_or_else(LockId::next);
        store.lock(item, lock)?;
        store.persist_lock(item, lock, &transaction)?;
        value.record_binding(item, lock)?;
        Ok(())
    }

    /// The transaction removing the bound value rolled back: the value
    /// releases its persistent lock (exactly once) and the reservation is
    /// dropped so the message can be redelivered elsewhere. No orphaned
    /// lock may remain in the store.
    pub fn release_binding_on_rollback(
        &self,
        value: &ValueTick,
        store: &dyn DurableStore,
    ) -> Result<()> {
        value.event_post_rollback_remove(store)?;
        self.envelope.set_reserved(false);
        Ok(())
    }

    fn inform_locked_once(&self) {
        if let Some(key) = self.dispatch_key.lock().as_ref() {
            if !self.informed_key_locked.swap(true, Ordering::SeqCst) {
                key.message_locked(self.tick);
            }
        }
    }

    /// The message was locked to a consumer: prefetch accounting, once.
    pub fn event_locked(&self) {
        self.inform_locked_once();
    }

    /// The message came back unlocked: reverse the prefetch accounting if
    /// it had been counted, then drive the envelope's unlocked listeners.
    pub fn event_unlocked(&self) -> Result<()> {
        if self.informed_key_locked.swap(false, Ordering::SeqCst) {
            if let Some(key) = self.dispatch_key.lock().as_ref() {
                key.message_unlocked(self.tick);
            }
        }
        self.envelope.event_unlocked()
    }

    /// Unless the removing transaction is the flagged rejection, signal
    /// intent to accept.
    pub fn event_pre_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        if *self.reject_txn.lock() != Some(transaction.id()) {
            if let Some(responder) = self.responder.lock().as_ref() {
                responder.accept(self.tick);
            }
        }
        self.envelope.event_pre_commit_remove(transaction)
    }

    pub fn event_post_commit_remove(&self, transaction: &Transaction) -> Result<()> {
        self.inform_locked_once();
        let rejecting = *self.reject_txn.lock() == Some(transaction.id());
        if let Some(responder) = self.responder.lock().as_ref() {
            if rejecting {
                responder.rolled_back(self.tick);
            } else if self.reliability() < Reliability::AssuredPersistent {
                responder.committed(self.tick);
            }
        }
        self.envelope.event_post_commit_remove(transaction)
    }

    /// Expiry at the requester causes rejection: remember the expiring
    /// transaction so the completion handlers route it as a reject.
    pub fn event_expiry_notification(&self, transaction: &Transaction) -> Result<()> {
        *self.reject_txn.lock() = Some(transaction.id());
        self.envelope.event_expiry_notification(transaction)
    }

    /// The requester rejects no later than either deadline: the message's
    /// own expiry or the protocol reject timeout.
    pub fn max_time_in_store(&self) -> Option<u64> {
        match self.envelope.max_time_in_store() {
            Some(remaining) => Some(remaining.min(self.reject_timeout_ms)),
            None => Some(self.reject_timeout_ms),
        }
    }

    /// Persist this message under a fresh id. The stored record is the
    /// composite remote frame, so the informed flag survives a spill.
    pub fn add_to_store(
        &self,
        store: &Arc<dyn DurableStore>,
        transaction: &Transaction,
    ) -> Result<ItemId> {
        let id = store.allocate_id();
        let data = self.encode()?;
        store.add(id, self.storage_strategy(), &data, transaction)?;
        self.envelope.bind(store, id);
        Ok(id)
    }

    pub fn restore(store: &Arc<dyn DurableStore>, id: ItemId) -> Result<Self> {
        let bytes = store.read(id)?.ok_or_else(|| {
            StoreError::NotAvailable(format!("{id} not readable during restore"))
        })?;
        let message = <RemoteMessage as Persistable>::decode(&bytes)?;
        message.envelope.bind(store, id);
        Ok(message)
    }
}

/// Composite record: the body leads so envelope rehydration can read it as
/// a prefix; the remote-get sidecar follows.
impl Persistable for RemoteMessage {
    const CURRENT_VERSION: u16 = 1;

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        let err = |e: std::io::Error| StoreError::Internal(e.to_string());
        let body_frame = self.envelope.persistent_data()?;
        let (_, body_payload) = decode_frame(&body_frame)?;
        buf.extend_from_slice(body_payload);
        buf.write_u64::<LittleEndian>(self.tick.0).map_err(err)?;
        buf.write_u8(self.informed_key_locked.load(Ordering::SeqCst) as u8)
            .map_err(err)?;
        buf.write_u64::<LittleEndian>(self.reject_timeout_ms)
            .map_err(err)?;
        Ok(())
    }

    fn decode_payload(version: u16, payload: &[u8]) -> Result<Self> {
        require_version(Self::CURRENT_VERSION, version)?;
        let err = |e: std::io::Error| StoreError::Internal(e.to_string());
        let (body, read) = MessageBody::decode_prefix(payload)?;
        let mut cursor = Cursor::new(&payload[read..]);
        let tick = Tick(cursor.read_u64::<LittleEndian>().map_err(err)?);
        let informed = cursor.read_u8().map_err(err)? != 0;
        let reject_timeout_ms = cursor.read_u64::<LittleEndian>().map_err(err)?;
        if cursor.position() as usize != payload.len() - read {
            return Err(StoreError::Truncated {
                needed: read + cursor.position() as usize,
                found: payload.len(),
            });
        }
        let message = RemoteMessage::new(body, tick, reject_timeout_ms);
        message
            .informed_key_locked
            .store(informed, Ordering::SeqCst);
        Ok(message)
    }
}
