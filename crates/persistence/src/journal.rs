use crate::error::{PersistenceError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use courier_kernel::types::{ItemId, LockId, StorageStrategy};
use crc64fast::Digest;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_PERSIST_LOCK: u8 = 3;
const OP_CLEAR_LOCK: u8 = 4;
const OP_REDELIVERED_COUNT: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Add {
        item: ItemId,
        strategy: StorageStrategy,
        data: Bytes,
    },
    Remove {
        item: ItemId,
    },
    PersistLock {
        item: ItemId,
        lock: LockId,
    },
    ClearLock {
        item: ItemId,
    },
    RedeliveredCount {
        item: ItemId,
        count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub seq: u64,
    pub op: JournalOp,
}

/// On-disk frame: seq u64, op u8, item u64, aux u64, payload_len u32,
/// checksum u64, payload. The checksum covers everything before it plus
/// the payload.
struct FrameHeader {
    seq: u64,
    op: u8,
    item: u64,
    aux: u64,
    payload_len: u32,
    checksum: u64,
}

impl FrameHeader {
    const SIZE: usize = 8 + 1 + 8 + 8 + 4 + 8;

    fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf)?;
        let mut cursor = io::Cursor::new(&buf[..]);
        Ok(FrameHeader {
            seq: cursor.read_u64::<LittleEndian>()?,
            op: cursor.read_u8()?,
            item: cursor.read_u64::<LittleEndian>()?,
            aux: cursor.read_u64::<LittleEndian>()?,
            payload_len: cursor.read_u32::<LittleEndian>()?,
            checksum: cursor.read_u64::<LittleEndian>()?,
        })
    }

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = io::Cursor::new(&mut buf[..]);
            cursor.write_u64::<LittleEndian>(self.seq).unwrap();
            cursor.write_u8(self.op).unwrap();
            cursor.write_u64::<LittleEndian>(self.item).unwrap();
            cursor.write_u64::<LittleEndian>(self.aux).unwrap();
            cursor.write_u32::<LittleEndian>(self.payload_len).unwrap();
            cursor.write_u64::<LittleEndian>(self.checksum).unwrap();
        }
        buf
    }
}

fn frame_checksum(seq: u64, op: u8, item: u64, aux: u64, payload: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&seq.to_le_bytes());
    digest.write(&[op]);
    digest.write(&item.to_le_bytes());
    digest.write(&aux.to_le_bytes());
    digest.write(&(payload.len() as u32).to_le_bytes());
    digest.write(payload);
    digest.sum64()
}

fn op_parts(op: &JournalOp) -> (u8, u64, u64, &[u8]) {
    match op {
        JournalOp::Add {
            item,
            strategy,
            data,
        } => (OP_ADD, item.0, strategy.as_u8() as u64, data.as_ref()),
        JournalOp::Remove { item } => (OP_REMOVE, item.0, 0, &[]),
        JournalOp::PersistLock { item, lock } => (OP_PERSIST_LOCK, item.0, lock.0, &[]),
        JournalOp::ClearLock { item } => (OP_CLEAR_LOCK, item.0, 0, &[]),
        JournalOp::RedeliveredCount { item, count } => {
            (OP_REDELIVERED_COUNT, item.0, *count as u64, &[])
        }
    }
}

/// Append one frame and sync it before returning.
pub fn append_record(file: &mut File, seq: u64, op: &JournalOp) -> Result<()> {
    let (op_code, item, aux, payload) = op_parts(op);
    let header = FrameHeader {
        seq,
        op: op_code,
        item,
        aux,
        payload_len: payload.len() as u32,
        checksum: frame_checksum(seq, op_code, item, aux, payload),
    };
    file.write_all(&header.to_bytes())?;
    file.write_all(payload)?;
    file.sync_data()?;
    Ok(())
}

pub fn open_for_append(path: impl AsRef<Path>) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

pub struct JournalReader {
    reader: BufReader<File>,
}

impl JournalReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(JournalReader {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl Iterator for JournalReader {
    type Item = Result<JournalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match FrameHeader::read_from(&mut self.reader) {
            Ok(header) => header,
            Err(PersistenceError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return None
            }
            Err(e) => return Some(Err(e)),
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            return Some(Err(PersistenceError::IoError(e)));
        }

        let computed = frame_checksum(header.seq, header.op, header.item, header.aux, &payload);
        if computed != header.checksum {
            return Some(Err(PersistenceError::ChecksumMismatch {
                expected: header.checksum,
                found: computed,
            }));
        }

        let item = ItemId(header.item);
        let op = match header.op {
            OP_ADD => {
                let strategy = match StorageStrategy::from_u8(header.aux as u8) {
                    Ok(strategy) => strategy,
                    Err(e) => {
                        return Some(Err(PersistenceError::InvalidFormat(e.to_string())))
                    }
                };
                JournalOp::Add {
                    item,
                    strategy,
                    data: Bytes::from(payload),
                }
            }
            OP_REMOVE => JournalOp::Remove { item },
            OP_PERSIST_LOCK => JournalOp::PersistLock {
                item,
                lock: LockId(header.aux),
            },
            OP_CLEAR_LOCK => JournalOp::ClearLock { item },
            OP_REDELIVERED_COUNT => JournalOp::RedeliveredCount {
                item,
                count: header.aux as u32,
            },
            other => {
                return Some(Err(PersistenceError::InvalidFormat(format!(
                    "unknown op code {other}"
                ))))
            }
        };

        Some(Ok(JournalRecord {
            seq: header.seq,
            op,
        }))
    }
}

pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
    JournalReader::new(path)?.collect()
}
