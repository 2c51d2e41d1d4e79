//! Domain Layer - record shapes, checkpoint bookkeeping and configuration
//!
//! No I/O happens here.

pub mod checkpoint;
pub mod config;
pub mod records;

pub use checkpoint::{
    journal_entries, Checkpoint, CheckpointStack, JournalEntry, JournalReplay, PendingInterval,
    RevertStep, SpentEntry,
};
pub use config::UtxoStoreConfig;
pub use records::{outpoint_key, tombstone_outpoint, StoredFilter, UtxoRecord};
