// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Schema-versioned persistent record contract.
//!
//! Every record handed to the durable log is framed as
//!
//! ```text
//! [schema version u16][payload len u32][payload][crc64 u64]
//! ```
//!
//! little-endian throughout, with the checksum covering version, length and
//! payload. Decode verifies the checksum and the exact length before any
//! payload byte is interpreted; there is no partial or best-effort decode.
//!
//! A stored version other than the implementor's current one is a fatal
//! `SchemaVersionMismatch`, except where an implementor explicitly branches
//! on an older version to apply a one-time upward transform.

use crate::error::{Result, StoreError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc64fast::Digest;
use std::io::Cursor;

const FRAME_HEADER_SIZE: usize = 2 + 4;
const FRAME_TRAILER_SIZE: usize = 8;

pub trait Persistable: Sized {
    /// The schema version this build writes.
    const CURRENT_VERSION: u16;

    /// Append the record payload (without frame) to `buf`.
    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Rebuild the record from a verified payload. `version` is the stored
    /// schema version; implementors that support no legacy versions should
    /// start with [`require_version`].
    fn decode_payload(version: u16, payload: &[u8]) -> Result<Self>;

    fn encode(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload)?;
        encode_frame(Self::CURRENT_VERSION, &payload)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let (version, payload) = decode_frame(bytes)?;
        if version > Self::CURRENT_VERSION {
            return Err(StoreError::SchemaVersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: version,
            });
        }
        Self::decode_payload(version, payload)
    }
}

/// Fail with `SchemaVersionMismatch` unless the stored version is exactly
/// the expected one.
pub fn require_version(expected: u16, found: u16) -> Result<()> {
    if expected != found {
        return Err(StoreError::SchemaVersionMismatch { expected, found });
    }
    Ok(())
}

pub fn encode_frame(version: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
    buf.write_u16::<LittleEndian>(version)
        .map_err(|e| StoreError::Internal(format!("frame write failed: {e}")))?;
    buf.write_u32::<LittleEndian>(payload.len() as u32)
        .map_err(|e| StoreError::Internal(format!("frame write failed: {e}")))?;
    buf.extend_from_slice(payload);

    let mut digest = Digest::new();
    digest.write(&buf);
    buf.write_u64::<LittleEndian>(digest.sum64())
        .map_err(|e| StoreError::Internal(format!("frame write failed: {e}")))?;
    Ok(buf)
}

/// Verify the frame and return the stored version and payload slice.
pub fn decode_frame(bytes: &[u8]) -> Result<(u16, &[u8])> {
    if bytes.len() < FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE {
        return Err(StoreError::Truncated {
            needed: FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE,
            found: bytes.len(),
        });
    }

    let mut cursor = Cursor::new(bytes);
    let version = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| StoreError::Internal(format!("frame read failed: {e}")))?;
    let payload_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| StoreError::Internal(format!("frame read failed: {e}")))? as usize;

    let expected_len = FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE;
    if bytes.len() != expected_len {
        return Err(StoreError::Truncated {
            needed: expected_len,
            found: bytes.len(),
        });
    }

    let payload = &bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len];

    let mut digest = Digest::new();
    digest.write(&bytes[..FRAME_HEADER_SIZE + payload_len]);
    let computed = digest.sum64();
    let stored = u64::from_le_bytes(
        bytes[FRAME_HEADER_SIZE + payload_len..]
            .try_into()
            .map_err(|_| StoreError::Truncated {
                needed: expected_len,
                found: bytes.len(),
            })?,
    );
    if computed != stored {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            found: computed,
        });
    }

    Ok((version, payload))
}
