//! Error types for the index builder

use std::path::PathBuf;

use bitcoin::Network;
use fi_01_golomb_filters::FilterError;
use fi_02_record_store::StorageError;
use thiserror::Error;

use crate::domain::ServiceState;

/// Errors from the index builder service.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chain source error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Operation not allowed while {0:?}")]
    InvalidState(ServiceState),

    #[error("Scan task failed: {0}")]
    Task(String),

    #[error("Height {height} past the end of the 32-bit range")]
    HeightOverflow { height: u64 },
}

/// Errors reported by a chain source.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Chain source unavailable: {0}")]
    Unavailable(String),
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No default start height for {0}, set start_height")]
    UnsupportedNetwork(Network),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
