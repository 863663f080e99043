use crate::error::{PersistenceError, Result};
use crate::journal::{self, JournalOp, JournalRecord};
use bytes::Bytes;
use courier_kernel::error::StoreError;
use courier_kernel::store::DurableStore;
use courier_kernel::txn::Transaction;
use courier_kernel::types::{ItemId, LockId, StorageStrategy};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct Entry {
    data: Bytes,
    strategy: StorageStrategy,
    lock: Option<LockId>,
    persisted_lock: Option<LockId>,
    unlock_count: u32,
    redelivered_count: u32,
}

struct Inner {
    file: File,
    entries: FxHashMap<ItemId, Entry>,
    next_seq: u64,
    next_item: u64,
}

/// Journal-backed [`DurableStore`]: every durable mutation is one appended
/// frame, and open replays the journal to rebuild state. Persistent locks
/// are restored as held locks, which is what the supplier-side recovery
/// scan compares value ticks against.
pub struct JournalStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JournalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries: FxHashMap<ItemId, Entry> = FxHashMap::default();
        let mut next_seq = 0;
        let mut next_item = 1;

        if path.exists() {
            for record in journal::JournalReader::new(&path)? {
                let JournalRecord { seq, op } = record?;
                next_seq = next_seq.max(seq + 1);
                match op {
                    JournalOp::Add {
                        item,
                        strategy,
                        data,
                    } => {
                        next_item = next_item.max(item.0 + 1);
                        entries.insert(
                            item,
                            Entry {
                                data,
                                strategy,
                                lock: None,
                                persisted_lock: None,
                                unlock_count: 0,
                                redelivered_count: 0,
                            },
                        );
                    }
                    JournalOp::Remove { item } => {
                        entries.remove(&item);
                    }
                    JournalOp::PersistLock { item, lock } => {
                        if let Some(entry) = entries.get_mut(&item) {
                            entry.persisted_lock = Some(lock);
                            entry.lock = Some(lock);
                        }
                    }
                    JournalOp::ClearLock { item } => {
                        if let Some(entry) = entries.get_mut(&item) {
                            entry.persisted_lock = None;
                            entry.lock = None;
                        }
                    }
                    JournalOp::RedeliveredCount { item, count } => {
                        if let Some(entry) = entries.get_mut(&item) {
                            entry.redelivered_count = count;
                        }
                    }
                }
            }
            tracing::debug!(
                items = entries.len(),
                frames = next_seq,
                "journal replay complete"
            );
        }

        let file = journal::open_for_append(&path)?;
        Ok(JournalStore {
            path,
            inner: Mutex::new(Inner {
                file,
                entries,
                next_seq,
                next_item,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn append(inner: &mut Inner, op: &JournalOp) -> Result<()> {
        let seq = inner.next_seq;
        journal::append_record(&mut inner.file, seq, op)?;
        inner.next_seq += 1;
        Ok(())
    }
}

fn store_err(e: PersistenceError) -> StoreError {
    StoreError::Internal(format!("journal failure: {e}"))
}

impl DurableStore for JournalStore {
    fn allocate_id(&self) -> ItemId {
        let mut inner = self.inner.lock();
        let id = ItemId(inner.next_item);
        inner.next_item += 1;
        id
    }

    fn add(
        &self,
        item: ItemId,
        strategy: StorageStrategy,
        data: &[u8],
        _transaction: &Transaction,
    ) -> courier_kernel::Result<()> {
        if strategy == StorageStrategy::Never {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let data = Bytes::copy_from_slice(data);
        Self::append(
            &mut inner,
            &JournalOp::Add {
                item,
                strategy,
                data: data.clone(),
            },
        )
        .map_err(store_err)?;
        inner.entries.insert(
            item,
            Entry {
                data,
                strategy,
                lock: None,
                persisted_lock: None,
                unlock_count: 0,
                redelivered_count: 0,
            },
        );
        Ok(())
    }

    fn remove(&self, item: ItemId, _transaction: &Transaction) -> courier_kernel::Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&item) {
            Self::append(&mut inner, &JournalOp::Remove { item }).map_err(store_err)?;
            inner.entries.remove(&item);
        }
        Ok(())
    }

    fn read(&self, item: ItemId) -> courier_kernel::Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .entries
            .get(&item)
            .map(|entry| entry.data.to_vec()))
    }

    fn contains(&self, item: ItemId) -> bool {
        self.inner.lock().entries.contains_key(&item)
    }

    fn lock(&self, item: ItemId, lock: LockId) -> courier_kernel::Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
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

    fn persist_lock(
        &self,
        item: ItemId,
        lock: LockId,
        _transaction: &Transaction,
    ) -> courier_kernel::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&item) {
            return Err(StoreError::NotInStore(item));
        }
        Self::append(&mut inner, &JournalOp::PersistLock { item, lock }).map_err(store_err)?;
        if let Some(entry) = inner.entries.get_mut(&item) {
            entry.persisted_lock = Some(lock);
            entry.lock = Some(lock);
        }
        Ok(())
    }

    fn lock_id(&self, item: ItemId) -> courier_kernel::Result<Option<LockId>> {
        Ok(self
            .inner
            .lock()
            .entries
            .get(&item)
            .and_then(|entry| entry.lock))
    }

    fn unlock(&self, item: ItemId, lock: LockId, increment: bool) -> courier_kernel::Result<()> {
        let mut inner = self.inner.lock();
        let (held, persisted) = match inner.entries.get(&item) {
            None => return Ok(()),
            Some(entry) => (
                entry.lock == Some(lock) || entry.persisted_lock == Some(lock),
                entry.persisted_lock.is_some(),
            ),
        };
        if !held {
            return Ok(());
        }
        if persisted {
            Self::append(&mut inner, &JournalOp::ClearLock { item }).map_err(store_err)?;
        }
        if let Some(entry) = inner.entries.get_mut(&item) {
            entry.lock = None;
            entry.persisted_lock = None;
            if increment {
                entry.unlock_count += 1;
            }
        }
        Ok(())
    }

    fn unlock_count(&self, item: ItemId) -> u32 {
        self.inner
            .lock()
            .entries
            .get(&item)
            .map(|entry| entry.unlock_count)
            .unwrap_or(0)
    }

    fn persisted_redelivered_count(&self, item: ItemId) -> u32 {
        self.inner
            .lock()
            .entries
            .get(&item)
            .map(|entry| entry.redelivered_count)
            .unwrap_or(0)
    }

    fn persist_redelivered_count(&self, item: ItemId, count: u32) -> courier_kernel::Result<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&item) {
            return Err(StoreError::NotInStore(item));
        }
        Self::append(&mut inner, &JournalOp::RedeliveredCount { item, count })
            .map_err(store_err)?;
        if let Some(entry) = inner.entries.get_mut(&item) {
            entry.redelivered_count = count;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_kernel::anycast::ValueTick;
    use courier_kernel::types::{Reliability, Tick};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.log");
        let txn = Transaction::auto_commit();

        let (kept, removed) = {
            let store = JournalStore::open(&path).unwrap();
            let kept = store.allocate_id();
            let removed = store.allocate_id();
            store
                .add(kept, StorageStrategy::Always, b"keep-me", &txn)
                .unwrap();
            store
                .add(removed, StorageStrategy::Eventually, b"drop-me", &txn)
                .unwrap();
            store.lock(kept, LockId(5)).unwrap();
            store.persist_lock(kept, LockId(5), &txn).unwrap();
            store.persist_redelivered_count(kept, 3).unwrap();
            store.remove(removed, &txn).unwrap();
            (kept, removed)
        };

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(kept).unwrap().unwrap(), b"keep-me");
        assert_eq!(store.read(removed).unwrap(), None);
        // The persistent lock came back as a held lock.
        assert_eq!(store.lock_id(kept).unwrap(), Some(LockId(5)));
        assert_eq!(store.persisted_redelivered_count(kept), 3);
        // Ids never collide with recovered items.
        assert!(store.allocate_id() > kept);
    }

    #[test]
    fn never_strategy_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.log");
        let txn = Transaction::auto_commit();
        let store = JournalStore::open(&path).unwrap();
        let id = store.allocate_id();
        store
            .add(id, StorageStrategy::Never, b"express", &txn)
            .unwrap();
        assert!(!store.contains(id));
        assert!(journal::read_all(&path).unwrap().is_empty());
    }

    #[test]
    fn unpersisted_lock_does_not_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.log");
        let txn = Transaction::auto_commit();

        let id = {
            let store = JournalStore::open(&path).unwrap();
            let id = store.allocate_id();
            store
                .add(id, StorageStrategy::Eventually, b"m", &txn)
                .unwrap();
            store.lock(id, LockId(9)).unwrap();
            id
        };

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.lock_id(id).unwrap(), None);
    }

    /// Supplier-side recovery: a value tick whose message lost its lock
    /// across the restart is stale and gets discarded through the
    /// idempotent unlock path.
    #[test]
    fn recovery_scan_discards_stale_value_ticks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.log");
        let txn = Transaction::auto_commit();

        let (bound, unbound) = {
            let store = JournalStore::open(&path).unwrap();
            let bound = store.allocate_id();
            let unbound = store.allocate_id();
            store
                .add(bound, StorageStrategy::Eventually, b"m1", &txn)
                .unwrap();
            store
                .add(unbound, StorageStrategy::Eventually, b"m2", &txn)
                .unwrap();
            store.lock(bound, LockId(21)).unwrap();
            store.persist_lock(bound, LockId(21), &txn).unwrap();
            // The second lock was taken but never persisted.
            store.lock(unbound, LockId(22)).unwrap();
            (bound, unbound)
        };

        let store: Arc<dyn DurableStore> = Arc::new(JournalStore::open(&path).unwrap());
        let good = ValueTick::new(
            Tick(40),
            bound,
            Reliability::ReliablePersistent,
            1,
            Some(LockId(21)),
            0,
            None,
            None,
        );
        let stale = ValueTick::new(
            Tick(41),
            unbound,
            Reliability::ReliablePersistent,
            1,
            Some(LockId(22)),
            0,
            None,
            None,
        );
        assert!(good.verify_restored(store.as_ref()).unwrap());
        assert!(!stale.verify_restored(store.as_ref()).unwrap());

        // Discard path: release whatever the stale tick thought it held.
        stale
            .event_post_rollback_remove(store.as_ref())
            .unwrap();
        assert_eq!(store.lock_id(unbound).unwrap(), None);
    }
}
