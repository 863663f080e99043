// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Durable store contract and the in-memory reference implementation.
//!
//! The production journal engine is an external collaborator: an ordered,
//! transactional, crash-recoverable log. This module defines only the
//! surface the kernel consumes — add/remove under a transaction, raw read
//! for rehydration, item locking with persistent lock ids, and the unlock
//! and redelivery counters. `MemoryStore` implements it for the kernel's
//! own handshakes and for tests; `courier-persistence` provides the
//! file-backed implementation.

use crate::error::{Result, StoreError};
use crate::txn::Transaction;
use crate::types::{ItemId, LockId, StorageStrategy};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait DurableStore: Send + Sync {
    /// Allocate a store-unique item id.
    fn allocate_id(&self) -> ItemId;

    fn add(
        &self,
        item: ItemId,
        strategy: StorageStrategy,
        data: &[u8],
        transaction: &Transaction,
    ) -> Result<()>;

    fn remove(&self, item: ItemId, transaction: &Transaction) -> Result<()>;

    /// Raw persisted bytes, or `None` when the item was never spilled or
    /// has been removed.
    fn read(&self, item: ItemId) -> Result<Option<Vec<u8>>>;

    /// Whether a durable representation of the item currently exists.
    fn contains(&self, item: ItemId) -> bool;

    /// Take the in-memory lock. Fails if the item is locked under a
    /// different id.
    fn lock(&self, item: ItemId, lock: LockId) -> Result<()>;

    /// Record the lock durably so it survives restart.
    fn persist_lock(&self, item: ItemId, lock: LockId, transaction: &Transaction) -> Result<()>;

    fn lock_id(&self, item: ItemId) -> Result<Option<LockId>>;

    /// Release the lock if `lock` matches the holder. Idempotent: unlocking
    /// an already-unlocked item is a no-op. `increment` bumps the store's
    /// unlock counter.
    fn unlock(&self, item: ItemId, lock: LockId, increment: bool) -> Result<()>;

    /// The store's own unlock counter for the item.
    fn unlock_count(&self, item: ItemId) -> u32;

    fn persisted_redelivered_count(&self, item: ItemId) -> u32;

    fn persist_redelivered_count(&self, item: ItemId, count: u32) -> Result<()>;

    /// Whether the backing schema has the redelivery count column.
    fn supports_redelivery_column(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    strategy: StorageStrategy,
    lock: Option<LockId>,
    persisted_lock: Option<LockId>,
    unlock_count: u32,
    redelivered_count: u32,
}

impl Entry {
    fn new(strategy: StorageStrategy, data: Vec<u8>) -> Self {
        Entry {
            data,
            strategy,
            lock: None,
            persisted_lock: None,
            unlock_count: 0,
            redelivered_count: 0,
        }
    }
}

pub struct MemoryStore {
    entries: Mutex<FxHashMap<ItemId, Entry>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for MemoryStore {
    fn allocate_id(&self) -> ItemId {
        ItemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add(
        &self,
        item: ItemId,
        strategy: StorageStrategy,
        data: &[u8],
        _transaction: &Transaction,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        // A Never item has no durable representation to rehydrate from.
        if strategy == StorageStrategy::Never {
            return Ok(());
        }
        entries.insert(item, Entry::new(strategy, data.to_vec()));
        Ok(())
    }

    fn remove(&self, item: ItemId, _transaction: &Transaction) -> Result<()> {
        self.entries.lock().remove(&item);
        Ok(())
    }

    fn read(&self, item: ItemId) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&item).map(|entry| entry.data.clone()))
    }

    fn contains(&self, item: ItemId) -> bool {
        self.entries.lock().contains_key(&item)
    }

    fn lock(&self, item: ItemId, lock: LockId) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&item)
            .ok_or(StoreError::NotInStore(item))?;
        match entry.lock {
            Some(held) if held != lock => Err(StoreError::Internal(format!(
                "item {item} already locked under {held:?}"
            ))),
            _ => {
                entry.lock = Some(lock);
                Ok(())
            }
        }
    }

    fn persist_lock(&self, item: ItemId, lock: LockId, _transaction: &Transaction) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&item)
            .ok_or(StoreError::NotInStore(item))?;
        entry.persisted_lock = Some(lock);
        Ok(())
    }

    fn lock_id(&self, item: ItemId) -> Result<Option<LockId>> {
        Ok(self.entries.lock().get(&item).and_then(|entry| entry.lock))
    }

    fn unlock(&self, item: ItemId, lock: LockId, increment: bool) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&item) else {
            // Removed items have nothing left to release.
            return Ok(());
        };
        if entry.lock == Some(lock) || entry.persisted_lock == Some(lock) {
            entry.lock = None;
            entry.persisted_lock = None;
            if increment {
                entry.unlock_count += 1;
            }
        }
        Ok(())
    }

    fn unlock_count(&self, item: ItemId) -> u32 {
        self.entries
            .lock()
            .get(&item)
            .map(|entry| entry.unlock_count)
            .unwrap_or(0)
    }

    fn persisted_redelivered_count(&self, item: ItemId) -> u32 {
        self.entries
            .lock()
            .get(&item)
            .map(|entry| entry.redelivered_count)
            .unwrap_or(0)
    }

    fn persist_redelivered_count(&self, item: ItemId, count: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&item)
            .ok_or(StoreError::NotInStore(item))?;
        entry.redelivered_count = count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_items_are_not_retained() {
        let store = MemoryStore::new();
        let id = store.allocate_id();
        let txn = Transaction::auto_commit();
        store
            .add(id, StorageStrategy::Never, b"gone", &txn)
            .unwrap();
        assert!(!store.contains(id));
        assert_eq!(store.read(id).unwrap(), None);
    }

    #[test]
    fn lock_conflicts_are_rejected() {
        let store = MemoryStore::new();
        let id = store.allocate_id();
        let txn = Transaction::auto_commit();
        store
            .add(id, StorageStrategy::Always, b"payload", &txn)
            .unwrap();
        store.lock(id, LockId(1)).unwrap();
        // Re-locking under the same id is fine; a different id is not.
        store.lock(id, LockId(1)).unwrap();
        assert!(store.lock(id, LockId(2)).is_err());
    }

    #[test]
    fn unlock_is_idempotent_and_counts() {
        let store = MemoryStore::new();
        let id = store.allocate_id();
        let txn = Transaction::auto_commit();
        store
            .add(id, StorageStrategy::Always, b"payload", &txn)
            .unwrap();
        store.lock(id, LockId(9)).unwrap();
        store.unlock(id, LockId(9), true).unwrap();
        store.unlock(id, LockId(9), true).unwrap();
        assert_eq!(store.unlock_count(id), 1);
        assert_eq!(store.lock_id(id).unwrap(), None);
    }

    #[test]
    fn unlock_with_wrong_id_is_a_no_op() {
        let store = MemoryStore::new();
        let id = store.allocate_id();
        let txn = Transaction::auto_commit();
        store
            .add(id, StorageStrategy::Always, b"payload", &txn)
            .unwrap();
        store.lock(id, LockId(9)).unwrap();
        store.unlock(id, LockId(8), true).unwrap();
        assert_eq!(store.lock_id(id).unwrap(), Some(LockId(9)));
        assert_eq!(store.unlock_count(id), 0);
    }
}
