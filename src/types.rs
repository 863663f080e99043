// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identifier newtypes and the ordered quality-of-service enums.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned identity of a persisted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

/// Producer-assigned identity of a logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(pub u64);

impl LockId {
    /// Allocate a process-unique lock id for bindings that arrive without
    /// one.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a messaging engine within the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u64);

/// Identity of the producing connection, serialized with the message when
/// durable-subscription matching needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Position in a per-destination protocol stream. Strictly increasing per
/// stream; issued by the requesting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item:{}", self.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.0)
    }
}

/// Highest message priority carried on the bus. Priorities run 0..=9.
pub const MAX_PRIORITY: u8 = 9;

/// Ordered quality-of-service level of a message, from best-effort up to
/// assured-persistent. The ordering is load-bearing: storage strategies and
/// anycast storage policies are derived from comparisons on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reliability {
    BestEffortNonPersistent = 0,
    ExpressNonPersistent = 1,
    ReliableNonPersistent = 2,
    ReliablePersistent = 3,
    AssuredPersistent = 4,
}

impl Reliability {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Reliability::BestEffortNonPersistent),
            1 => Ok(Reliability::ExpressNonPersistent),
            2 => Ok(Reliability::ReliableNonPersistent),
            3 => Ok(Reliability::ReliablePersistent),
            4 => Ok(Reliability::AssuredPersistent),
            other => Err(StoreError::Internal(format!(
                "unknown reliability value {other}"
            ))),
        }
    }
}

/// Durability tier assigned to a record in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StorageStrategy {
    Never = 0,
    Maybe = 1,
    Eventually = 2,
    Always = 3,
}

impl StorageStrategy {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StorageStrategy::Never),
            1 => Ok(StorageStrategy::Maybe),
            2 => Ok(StorageStrategy::Eventually),
            3 => Ok(StorageStrategy::Always),
            other => Err(StoreError::Internal(format!(
                "unknown storage strategy value {other}"
            ))),
        }
    }
}

/// Whether a message must keep its full persistence level.
///
/// A message referenced only by non-durable consumers can be stored at
/// `Maybe` regardless of its reliability; any durable reference pins the
/// reliability-derived tier. `Unknown` means no references have been noted
/// yet (point-to-point, or no subscriptions), which behaves like durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainPersistence {
    Unknown,
    NonDurableOnly,
    Durable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_ordering() {
        assert!(Reliability::BestEffortNonPersistent < Reliability::ExpressNonPersistent);
        assert!(Reliability::ReliablePersistent < Reliability::AssuredPersistent);
        assert!(Reliability::ReliableNonPersistent <= Reliability::ReliableNonPersistent);
    }

    #[test]
    fn reliability_u8_roundtrip() {
        for value in 0..=4u8 {
            let rel = Reliability::from_u8(value).unwrap();
            assert_eq!(rel.as_u8(), value);
        }
        assert!(Reliability::from_u8(5).is_err());
    }

    #[test]
    fn storage_strategy_ordering_and_roundtrip() {
        assert!(StorageStrategy::Never < StorageStrategy::Maybe);
        assert!(StorageStrategy::Eventually < StorageStrategy::Always);
        for value in 0..=3u8 {
            let strategy = StorageStrategy::from_u8(value).unwrap();
            assert_eq!(strategy.as_u8(), value);
        }
        assert!(StorageStrategy::from_u8(9).is_err());
    }
}
