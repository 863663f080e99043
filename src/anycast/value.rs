// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Supplier-side record of one value tick handed to a requester.
//!
//! The record may outlive the message it was created for (the message can
//! be consumed remotely before the local remove commits), so it caches the
//! priority and reliability needed to rebuild in-memory state without it.
//!
//! Two one-way flags gate the tick's end of life: `flushing` marks the
//! handshake abandoned (stream teardown) and is never cleared — a message
//! restored afterwards must not be locked to this value; `removing` marks
//! the remove in flight. On rollback of the remove, the persistent lock on
//! the underlying message is released exactly once.

use crate::error::{Result, StoreError};
use crate::record::{require_version, Persistable};
use crate::store::DurableStore;
use crate::types::{EngineId, ItemId, LockId, Reliability, StorageStrategy, Tick};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Clone, Copy)]
struct LockState {
    persistent_lock: Option<LockId>,
    /// Set when the lock has been released after a remove rollback, so the
    /// release happens exactly once.
    released: bool,
}

pub struct ValueTick {
    tick: Tick,
    /// Store identity of the message instance this value hands out.
    msg_item: Mutex<Option<ItemId>>,
    storage_policy: StorageStrategy,
    lock: Mutex<LockState>,
    wait_time: u64,
    /// Backward link to the previous value of the same priority +
    /// reliability class; the chain is acyclic and strictly decreasing.
    prev_tick: Option<Tick>,
    source_engine: Option<EngineId>,
    priority: u8,
    reliability: Reliability,
    flushing: AtomicBool,
    removing: AtomicBool,
    restored: AtomicBool,
}

impl ValueTick {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tick: Tick,
        msg_item: ItemId,
        reliability: Reliability,
        priority: u8,
        persistent_lock: Option<LockId>,
        wait_time: u64,
        prev_tick: Option<Tick>,
        source_engine: Option<EngineId>,
    ) -> Self {
        ValueTick {
            tick,
            msg_item: Mutex::new(Some(msg_item)),
            storage_policy: Self::storage_policy_for(reliability),
            lock: Mutex::new(LockState {
                persistent_lock,
                released: false,
            }),
            wait_time,
            prev_tick,
            source_engine,
            priority,
            reliability,
            flushing: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            restored: AtomicBool::new(false),
        }
    }

    /// Express messages (at or below reliable non-persistent) are handed
    /// out without any persistent record or lock; reliable ones are written
    /// lazily; assured ones always.
    pub fn storage_policy_for(reliability: Reliability) -> StorageStrategy {
        if reliability <= Reliability::ReliableNonPersistent {
            StorageStrategy::Never
        } else if reliability < Reliability::AssuredPersistent {
            StorageStrategy::Eventually
        } else {
            StorageStrategy::Always
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn msg_item(&self) -> Option<ItemId> {
        *self.msg_item.lock()
    }

    pub fn storage_policy(&self) -> StorageStrategy {
        self.storage_policy
    }

    pub fn persistent_lock(&self) -> Option<LockId> {
        self.lock.lock().persistent_lock
    }

    pub fn wait_time(&self) -> u64 {
        self.wait_time
    }

    pub fn prev_tick(&self) -> Option<Tick> {
        self.prev_tick
    }

    pub fn source_engine(&self) -> Option<EngineId> {
        self.source_engine
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    /// One-way: once the stream is tearing down, the handshake for this
    /// value is abandoned for good.
    pub fn set_flushing(&self) {
        self.flushing.store(true, Ordering::SeqCst);
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// One-way false -> true; returns whether this call made the
    /// transition.
    pub fn set_removing(&self) -> bool {
        !self.removing.swap(true, Ordering::SeqCst)
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    pub(crate) fn set_restored(&self, restored: bool) {
        self.restored.store(restored, Ordering::SeqCst);
    }

    /// Record the message and lock bound to this value by the rebinding
    /// handshake. Refused once the value is flushing.
    pub fn record_binding(&self, msg_item: ItemId, lock: LockId) -> Result<()> {
        if self.is_flushing() {
            return Err(StoreError::Internal(format!(
                "binding attempted on flushing value {}",
                self.tick
            )));
        }
        *self.msg_item.lock() = Some(msg_item);
        let mut state = self.lock.lock();
        state.persistent_lock = Some(lock);
        state.released = false;
        Ok(())
    }

    /// The transaction removing this value rolled back: release the
    /// persistent lock taken on the underlying message, exactly once.
    /// Calling again, or calling for a value that never locked anything,
    /// is a no-op.
    pub fn event_post_rollback_remove(&self, store: &dyn DurableStore) -> Result<()> {
        let (item, lock) = {
            let mut state = self.lock.lock();
            if state.released {
                return Ok(());
            }
            let Some(lock) = state.persistent_lock else {
                return Ok(());
            };
            let Some(item) = *self.msg_item.lock() else {
                return Ok(());
            };
            state.released = true;
            (item, lock)
        };
        store.unlock(item, lock, false)?;
        tracing::debug!(tick = %self.tick, "released persistent lock after remove rollback");
        Ok(())
    }

    /// Recovery check for a restored value: the message must still exist
    /// and still carry the lock this value recorded, otherwise the value is
    /// stale and must be discarded through the idempotent unlock path.
    pub fn verify_restored(&self, store: &dyn DurableStore) -> Result<bool> {
        let Some(item) = *self.msg_item.lock() else {
            return Ok(false);
        };
        if self.storage_policy == StorageStrategy::Eventually {
            if !store.contains(item) {
                self.set_restored(false);
                return Ok(false);
            }
            if store.lock_id(item)? != self.persistent_lock() {
                self.set_restored(false);
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Persistable for ValueTick {
    /// Version 2 added the source engine id for message gathering; version
    /// 1 records are still read, with the field defaulted.
    const CURRENT_VERSION: u16 = 2;

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        let err = |e: std::io::Error| StoreError::Internal(e.to_string());
        buf.write_u64::<LittleEndian>(self.tick.0).map_err(err)?;
        let msg_item = self
            .msg_item()
            .ok_or_else(|| StoreError::Internal("value tick without message id".to_string()))?;
        buf.write_u64::<LittleEndian>(msg_item.0).map_err(err)?;
        buf.write_u8(self.storage_policy.as_u8()).map_err(err)?;
        match self.persistent_lock() {
            Some(lock) => {
                buf.write_u8(1).map_err(err)?;
                buf.write_u64::<LittleEndian>(lock.0).map_err(err)?;
            }
            None => {
                buf.write_u8(0).map_err(err)?;
                buf.write_u64::<LittleEndian>(0).map_err(err)?;
            }
        }
        buf.write_u64::<LittleEndian>(self.wait_time).map_err(err)?;
        match self.prev_tick {
            Some(prev) => {
                buf.write_u8(1).map_err(err)?;
                buf.write_u64::<LittleEndian>(prev.0).map_err(err)?;
            }
            None => {
                buf.write_u8(0).map_err(err)?;
                buf.write_u64::<LittleEndian>(0).map_err(err)?;
            }
        }
        buf.write_u8(self.priority).map_err(err)?;
        buf.write_u8(self.reliability.as_u8()).map_err(err)?;
        match self.source_engine {
            Some(engine) => {
                buf.write_u8(1).map_err(err)?;
                buf.write_u64::<LittleEndian>(engine.0).map_err(err)?;
            }
            None => {
                buf.write_u8(0).map_err(err)?;
                buf.write_u64::<LittleEndian>(0).map_err(err)?;
            }
        }
        Ok(())
    }

    fn decode_payload(version: u16, payload: &[u8]) -> Result<Self> {
        if version != 1 {
            require_version(Self::CURRENT_VERSION, version)?;
        }
        let err = |e: std::io::Error| StoreError::Internal(e.to_string());
        let mut cursor = Cursor::new(payload);
        let tick = Tick(cursor.read_u64::<LittleEndian>().map_err(err)?);
        let msg_item = ItemId(cursor.read_u64::<LittleEndian>().map_err(err)?);
        let storage_policy = StorageStrategy::from_u8(cursor.read_u8().map_err(err)?)?;
        let has_lock = cursor.read_u8().map_err(err)? != 0;
        let lock_raw = cursor.read_u64::<LittleEndian>().map_err(err)?;
        let wait_time = cursor.read_u64::<LittleEndian>().map_err(err)?;
        let has_prev = cursor.read_u8().map_err(err)? != 0;
        let prev_raw = cursor.read_u64::<LittleEndian>().map_err(err)?;
        let priority = cursor.read_u8().map_err(err)?;
        let reliability = Reliability::from_u8(cursor.read_u8().map_err(err)?)?;
        // v1 predates message gathering and carries no source engine.
        let source_engine = if version >= 2 {
            let has_source = cursor.read_u8().map_err(err)? != 0;
            let source_raw = cursor.read_u64::<LittleEndian>().map_err(err)?;
            has_source.then_some(EngineId(source_raw))
        } else {
            None
        };

        let value = ValueTick {
            tick,
            msg_item: Mutex::new(Some(msg_item)),
            storage_policy,
            lock: Mutex::new(LockState {
                persistent_lock: has_lock.then_some(LockId(lock_raw)),
                released: false,
            }),
            wait_time,
            prev_tick: has_prev.then_some(Tick(prev_raw)),
            source_engine,
            priority,
            reliability,
            flushing: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            restored: AtomicBool::new(true),
        };
        Ok(value)
    }
}
