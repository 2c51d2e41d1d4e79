//! # Storage Errors
//!
//! - Corruption found while scanning is not an error: the scan stops and
//!   reports where. A direct read of a bad record is one.
//! - Invalid records are rejected before any I/O happens.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by record logs, indexes and repositories.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Record at offset {offset} is {expected} bytes, replacement is {actual}")]
    LengthMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Offset {offset} does not fit a 32-bit index entry")]
    OffsetOverflow { offset: u64 },

    #[error("No record at offset {offset} (log length {len})")]
    RecordNotFound { offset: u64, len: u64 },

    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("Malformed record body: {0}")]
    Malformed(String),

    #[error("Key {key} already holds an unspent record")]
    DuplicateKey { key: String },

    #[error("{} is locked{}", .path.display(), lock_owner(.pid))]
    Locked { path: PathBuf, pid: Option<u32> },
}

fn lock_owner(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" by process {pid}"),
        None => String::new(),
    }
}

impl StorageError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::LengthMismatch {
            offset: 10,
            expected: 40,
            actual: 44,
        };
        assert!(err.to_string().contains("offset 10"));

        let err = StorageError::Locked {
            path: PathBuf::from("/data/LOCK"),
            pid: Some(42),
        };
        assert!(err.to_string().contains("process 42"));

        let err = StorageError::Locked {
            path: PathBuf::from("/data/LOCK"),
            pid: None,
        };
        assert_eq!(err.to_string(), "/data/LOCK is locked");
    }
}
