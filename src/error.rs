// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::events::MessageEvent;
use crate::types::ItemId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A stored record carries a schema version this build cannot read.
    /// Fatal: there is no migration path at this layer.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u16, found: u16 },

    #[error("Record checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: u64, found: u64 },

    #[error("Truncated record: needed {needed} bytes, found {found}")]
    Truncated { needed: usize, found: usize },

    /// The message body could not be serialized. The entity is unmodified.
    #[error("Persistent data encoding failed: {0}")]
    Encoding(#[from] bincode::error::EncodeError),

    #[error("Persistent data decoding failed: {0}")]
    Decoding(#[from] bincode::error::DecodeError),

    #[error("Message body unavailable for item {0}")]
    BodyUnavailable(ItemId),

    /// All listener slots for an event kind are occupied. Treated as an
    /// internal invariant violation, never a routine runtime condition.
    #[error("Listener slots exhausted for event {0:?}")]
    SlotsExhausted(MessageEvent),

    #[error("Item {0} is not in the store")]
    NotInStore(ItemId),

    /// Expected transient condition, e.g. an item held by an in-doubt
    /// transaction at restart. Callers defer initialisation and retry on a
    /// later callback rather than failing.
    #[error("Item not currently available: {0}")]
    NotAvailable(String),

    #[error("Internal messaging error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
