//! On-disk test scenario builder shared by integration tests.

use crate::error::Result;
use crate::store::JournalStore;
use courier_kernel::store::DurableStore;
use courier_kernel::txn::Transaction;
use courier_kernel::types::{ItemId, LockId, StorageStrategy};
use std::fs;
use std::path::{Path, PathBuf};

pub struct TestScenario {
    pub journal: PathBuf,
    /// An assured item with a persisted lock and a redelivery history.
    pub locked_item: ItemId,
    pub locked_lock: LockId,
    /// A reliable item with no lock.
    pub idle_item: ItemId,
}

/// Build a small journal: two stored items, one persistently locked and
/// redelivered twice, one idle; a third item added and removed again.
pub fn generate_test_scenario(dir: &Path) -> Result<TestScenario> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let journal = dir.join("items.log");
    let txn = Transaction::auto_commit();
    let store = JournalStore::open(&journal)?;

    let locked_item = store.allocate_id();
    let idle_item = store.allocate_id();
    let transient = store.allocate_id();
    let locked_lock = LockId(4_040);

    let add = |item, strategy, payload: &[u8]| {
        store
            .add(item, strategy, payload, &txn)
            .map_err(|e| crate::error::PersistenceError::InvalidFormat(e.to_string()))
    };
    add(locked_item, StorageStrategy::Always, b"assured-payload")?;
    add(idle_item, StorageStrategy::Eventually, b"reliable-payload")?;
    add(transient, StorageStrategy::Eventually, b"short-lived")?;

    let kernel_err =
        |e: courier_kernel::StoreError| crate::error::PersistenceError::InvalidFormat(e.to_string());
    store.lock(locked_item, locked_lock).map_err(kernel_err)?;
    store
        .persist_lock(locked_item, locked_lock, &txn)
        .map_err(kernel_err)?;
    store
        .persist_redelivered_count(locked_item, 2)
        .map_err(kernel_err)?;
    store.remove(transient, &txn).map_err(kernel_err)?;

    Ok(TestScenario {
        journal,
        locked_item,
        locked_lock,
        idle_item,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scenario_recovers_as_described() {
        let dir = tempdir().unwrap();
        let scenario = generate_test_scenario(dir.path()).unwrap();

        let store = JournalStore::open(&scenario.journal).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.lock_id(scenario.locked_item).unwrap(),
            Some(scenario.locked_lock)
        );
        assert_eq!(store.persisted_redelivered_count(scenario.locked_item), 2);
        assert_eq!(store.lock_id(scenario.idle_item).unwrap(), None);
    }
}
