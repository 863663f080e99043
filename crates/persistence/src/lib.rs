//! File-backed durable store for the courier kernel.
//!
//! An append-only journal of item operations, replayed on open to rebuild
//! the store's state. Every frame is crc64-checksummed; a torn tail frame
//! ends replay, anything else corrupt is an error.

pub mod error;
pub mod fixtures;
pub mod journal;
pub mod store;

pub use error::{PersistenceError, Result};
pub use journal::{JournalOp, JournalRecord};
pub use store::JournalStore;
