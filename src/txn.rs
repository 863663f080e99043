// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Transaction handles and the completion callback contract.
//!
//! The external transaction manager owns commit and rollback; this module
//! only defines what the kernel needs to observe them. Callbacks run
//! synchronously on the thread driving the outcome and must not wait on
//! external I/O. They may open new auto-commit transactions (the anycast
//! rebinding handshake does).

use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

impl TransactionId {
    /// Allocate a process-unique id. The external manager normally assigns
    /// ids; this is for transactions the kernel opens itself.
    pub fn next() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    auto_commit: bool,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Transaction {
            id,
            auto_commit: false,
        }
    }

    /// An auto-commit transaction: each operation is durable as soon as it
    /// returns, and no completion callbacks fire for it.
    pub fn auto_commit() -> Self {
        Transaction {
            id: TransactionId::next(),
            auto_commit: true,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }
}

/// Completion contract between the transaction manager and a stored entity.
///
/// `before_completion` runs before the outcome is decided; an error fails
/// the transaction. `after_completion` runs once the outcome is durable and
/// must not fail.
pub trait TransactionCallback: Send + Sync {
    fn before_completion(&self, transaction: &Transaction) -> Result<()>;
    fn after_completion(&self, transaction: &Transaction, committed: bool);
}

/// Minimal coordinator for driving completion callbacks in-process. The
/// production engine supplies its own manager; tests and the kernel's
/// internal handshakes use this one.
pub struct LocalTransaction {
    transaction: Transaction,
    callbacks: parking_lot::Mutex<Vec<Arc<dyn TransactionCallback>>>,
}

impl LocalTransaction {
    pub fn new() -> Self {
        LocalTransaction {
            transaction: Transaction::new(TransactionId::next()),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn register_callback(&self, callback: Arc<dyn TransactionCallback>) {
        self.callbacks.lock().push(callback);
    }

    pub fn commit(self) -> Result<()> {
        let callbacks = self.callbacks.into_inner();
        for callback in &callbacks {
            callback.before_completion(&self.transaction)?;
        }
        for callback in &callbacks {
            callback.after_completion(&self.transaction, true);
        }
        Ok(())
    }

    pub fn rollback(self) {
        let callbacks = self.callbacks.into_inner();
        for callback in &callbacks {
            callback.after_completion(&self.transaction, false);
        }
    }
}

impl Default for LocalTransaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        before: AtomicUsize,
        after_committed: AtomicUsize,
        after_rolled_back: AtomicUsize,
    }

    impl TransactionCallback for Recorder {
        fn before_completion(&self, _transaction: &Transaction) -> Result<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn after_completion(&self, _transaction: &Transaction, committed: bool) {
            if committed {
                self.after_committed.fetch_add(1, Ordering::SeqCst);
            } else {
                self.after_rolled_back.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn commit_drives_before_then_after() {
        let recorder = Arc::new(Recorder {
            before: AtomicUsize::new(0),
            after_committed: AtomicUsize::new(0),
            after_rolled_back: AtomicUsize::new(0),
        });
        let txn = LocalTransaction::new();
        txn.register_callback(recorder.clone());
        txn.commit().unwrap();
        assert_eq!(recorder.before.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.after_committed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.after_rolled_back.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rollback_skips_before_completion() {
        let recorder = Arc::new(Recorder {
            before: AtomicUsize::new(0),
            after_committed: AtomicUsize::new(0),
            after_rolled_back: AtomicUsize::new(0),
        });
        let txn = LocalTransaction::new();
        txn.register_callback(recorder.clone());
        txn.rollback();
        assert_eq!(recorder.before.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.after_rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auto_commit_ids_are_unique() {
        let a = Transaction::auto_commit();
        let b = Transaction::auto_commit();
        assert_ne!(a.id(), b.id());
        assert!(a.is_auto_commit());
    }
}
