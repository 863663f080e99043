// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Requester-side record of one outstanding remote get.
//!
//! Lifecycle: issued with a monotonically increasing tick; on commit of the
//! persisting transaction the callback target learns "committed" and the
//! stream's order gate opens for the next tick; on rollback the callback
//! only learns "rolled back" if the request had been marked unavailable by
//! the crash-recovery scan — a routine rollback is simply retried and needs
//! no signal.

use crate::anycast::gate::OrderGate;
use crate::error::{Result, StoreError};
use crate::record::{require_version, Persistable};
use crate::txn::Transaction;
use crate::types::{Reliability, StorageStrategy, Tick};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolState {
    Requested = 1,
    Accepted = 2,
    Rejected = 3,
    Completed = 4,
}

impl ProtocolState {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ProtocolState::Requested),
            2 => Ok(ProtocolState::Accepted),
            3 => Ok(ProtocolState::Rejected),
            4 => Ok(ProtocolState::Completed),
            other => Err(StoreError::Internal(format!(
                "unknown protocol state {other}"
            ))),
        }
    }
}

/// Transient target informed of the request's transaction outcome.
pub trait RequestCallback: Send + Sync {
    fn committed(&self, tick: Tick);
    fn rolled_back(&self, tick: Tick);
}

pub struct RequestItem {
    tick: Tick,
    state: Mutex<ProtocolState>,
    storage_policy: StorageStrategy,
    callback: Mutex<Option<Arc<dyn RequestCallback>>>,
    gate: Mutex<Option<Arc<OrderGate>>>,
    unavailable_after_recovery: AtomicBool,
}

impl RequestItem {
    pub fn new(tick: Tick, state: ProtocolState, reliability: Reliability) -> Self {
        RequestItem {
            tick,
            state: Mutex::new(state),
            storage_policy: Self::storage_policy_for(reliability),
            callback: Mutex::new(None),
            gate: Mutex::new(None),
            unavailable_after_recovery: AtomicBool::new(false),
        }
    }

    /// Storage policy derived from the reliability of the expected inbound
    /// message: assured requests must survive anything, reliable ones may
    /// be written lazily, everything else is never persisted.
    pub fn storage_policy_for(reliability: Reliability) -> StorageStrategy {
        match reliability {
            Reliability::AssuredPersistent => StorageStrategy::Always,
            Reliability::ReliablePersistent => StorageStrategy::Eventually,
            _ => StorageStrategy::Never,
        }
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn state(&self) -> ProtocolState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ProtocolState) {
        *self.state.lock() = state;
    }

    pub fn storage_policy(&self) -> StorageStrategy {
        self.storage_policy
    }

    pub fn set_callback(&self, callback: Arc<dyn RequestCallback>) {
        *self.callback.lock() = Some(callback);
    }

    pub fn set_order_gate(&self, gate: Arc<OrderGate>) {
        *self.gate.lock() = Some(gate);
    }

    /// Marked by the crash-recovery scan when the request cannot be served
    /// by the recovered stream.
    pub fn mark_unavailable_after_recovery(&self) {
        self.unavailable_after_recovery.store(true, Ordering::SeqCst);
    }

    pub fn is_unavailable_after_recovery(&self) -> bool {
        self.unavailable_after_recovery.load(Ordering::SeqCst)
    }

    /// The persisting transaction committed: tell the callback target and
    /// open the stream's order gate so the next request tick can proceed.
    pub fn event_post_commit_add(&self, _transaction: &Transaction) {
        if let Some(callback) = self.callback.lock().as_ref() {
            callback.committed(self.tick);
        }
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.clear();
        }
    }

    /// The persisting transaction rolled back. Only a request that
    /// recovery had already written off signals anything; a serviceable
    /// request is simply retried.
    pub fn event_post_rollback_add(&self, _transaction: &Transaction) {
        if self.is_unavailable_after_recovery() {
            if let Some(callback) = self.callback.lock().as_ref() {
                callback.rolled_back(self.tick);
            }
        }
    }
}

/// Higher tick sorts first: request indexes are kept reverse-chronological.
impl Ord for RequestItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.tick.cmp(&self.tick)
    }
}

impl PartialOrd for RequestItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RequestItem {
    fn eq(&self, other: &Self) -> bool {
        self.tick == other.tick
    }
}

impl Eq for RequestItem {}

impl Persistable for RequestItem {
    const CURRENT_VERSION: u16 = 1;

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<LittleEndian>(self.tick.0)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        buf.write_u8(self.state() as u8)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        buf.write_u8(self.storage_policy.as_u8())
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    fn decode_payload(version: u16, payload: &[u8]) -> Result<Self> {
        require_version(Self::CURRENT_VERSION, version)?;
        let mut cursor = Cursor::new(payload);
        let tick = Tick(
            cursor
                .read_u64::<LittleEndian>()
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        );
        let state = ProtocolState::from_u8(
            cursor
                .read_u8()
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        )?;
        let storage_policy = StorageStrategy::from_u8(
            cursor
                .read_u8()
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        )?;
        let item = RequestItem {
            tick,
            state: Mutex::new(state),
            storage_policy,
            callback: Mutex::new(None),
            gate: Mutex::new(None),
            unavailable_after_recovery: AtomicBool::new(false),
        };
        Ok(item)
    }
}
