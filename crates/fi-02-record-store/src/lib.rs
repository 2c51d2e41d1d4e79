//! # FI-02 Record Store
//!
//! Append-only record logs with hash indexes, and the filter and
//! unspent-output repositories built on them.
//!
//! ## Architecture
//!
//! - **Domain Layer** (`domain/`): Record shapes and checkpoint bookkeeping
//!   - `StoredFilter`, `UtxoRecord`: what the two logs hold
//!   - `CheckpointStack`: undo intervals for chain reorganizations
//!   - `JournalEntry`: the durable record of every checkpoint change
//!   - `UtxoStoreConfig`: packing and pruning tunables
//!
//! - **Ports Layer** (`ports/`): `RecordCodec`, body encoding per record type
//!
//! - **Adapters Layer** (`adapters/`): Files
//!   - `RecordLog`: framed, CRC-checked append-only log
//!   - `Index` / `CachedIndex`: fixed-size `(key, offset)` entries
//!   - `KeyedLog`: a record log paired with its index
//!   - `DirectoryLock`: one writer per data directory
//!
//! - **Service Layer** (`service/`)
//!   - `FilterRepository`: filters keyed by 32-byte hash
//!   - `UtxoRepository`: unspent witness outputs with checkpoints
//!
//! ## Frame Layout
//!
//! ```text
//! magic 0x4691 (2) | body_len (4) | body | crc32(body) (4)
//! ```
//!
//! A torn frame at the end of a log is cut off on open. Corruption anywhere
//! else is reported, never repaired.
//!
//! ## Usage Example
//!
//! ```ignore
//! use fi_02_record_store::{UtxoRepository, UtxoRecord, UtxoStoreConfig};
//!
//! let mut utxos = UtxoRepository::open(dir.join("utxos"), UtxoStoreConfig::default())?;
//! utxos.append(&UtxoRecord::new(outpoint, script))?;
//! utxos.checkpoint()?;
//!
//! utxos.delete(&outpoint)?;
//! utxos.checkpoint()?;
//!
//! // Chain reorganized: undo the spend
//! utxos.revert_to_checkpoint()?;
//! assert!(utxos.get(&outpoint)?.is_some());
//! ```

pub mod adapters;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

pub use adapters::{
    CachedIndex, DirectoryLock, FilterCodec, Index, IndexEntry, IndexEntryCodec, JournalCodec, Key,
    KeyedLog, LogRecord, RecordLog, ScanReport, ScanStop, UtxoCodec, ENTRY_FRAME_LEN, RECORD_MAGIC,
};
pub use domain::{
    outpoint_key, tombstone_outpoint, Checkpoint, CheckpointStack, JournalEntry, StoredFilter,
    UtxoRecord, UtxoStoreConfig,
};
pub use error::StorageError;
pub use ports::RecordCodec;
pub use service::{FilterRepository, UtxoRepository, FILTER_DATA_FILE, FILTER_INDEX_FILE};
