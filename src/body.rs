// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Opaque message body.
//!
//! The kernel does not interpret payload bytes; it only carries the
//! store-relevant header fields (reliability, priority, expiry, wait time)
//! alongside them. Encoding is deterministic bincode so a body read back
//! from the durable log is byte-identical to the one written.

use crate::error::Result;
use crate::types::{ConnectionId, MessageId, Reliability};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message_id: MessageId,
    pub reliability: Reliability,
    pub priority: u8,
    /// Milliseconds the message may spend in the bus. Zero means it never
    /// expires.
    pub time_to_live: u64,
    /// Accumulated wait across engines prior to and including this one, in
    /// milliseconds.
    pub wait_time: u64,
    /// Arrival timestamp at the current engine, milliseconds since epoch.
    pub arrival_timestamp: u64,
    pub connection_id: Option<ConnectionId>,
    pub redelivered_count: u32,
    /// Whether the producer asked to be told when this message expires.
    pub report_expiry: bool,
    pub payload: Vec<u8>,
}

impl MessageBody {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (body, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(body)
    }

    /// Decode a body from the front of `bytes`, returning the consumed
    /// length. Composite records lay their own fields out after the body.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let (body, read) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok((body, read))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_body(reliability: Reliability) -> MessageBody {
        MessageBody {
            message_id: MessageId(7),
            reliability,
            priority: 4,
            time_to_live: 60_000,
            wait_time: 0,
            arrival_timestamp: 1_700_000_000_000,
            connection_id: Some(ConnectionId(0xBEEF)),
            redelivered_count: 0,
            report_expiry: false,
            payload: b"order-42".to_vec(),
        }
    }

    #[test]
    fn body_roundtrip() {
        let body = sample_body(Reliability::AssuredPersistent);
        let bytes = body.encode().unwrap();
        let decoded = MessageBody::decode(&bytes).unwrap();
        assert_eq!(body, decoded);
    }

    #[test]
    fn body_encoding_is_deterministic() {
        let body = sample_body(Reliability::ReliablePersistent);
        assert_eq!(body.encode().unwrap(), body.encode().unwrap());
    }
}
