use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch { expected: u64, found: u64 },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
