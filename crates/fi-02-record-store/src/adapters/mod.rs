//! Adapters Layer - file-backed logs, indexes and codecs

pub mod codecs;
pub mod index;
pub mod keyed_log;
pub mod lock;
pub mod record_log;

pub use codecs::{FilterCodec, JournalCodec, UtxoCodec};
pub use index::{CachedIndex, Index, IndexEntry, IndexEntryCodec, Key, ENTRY_FRAME_LEN};
pub use keyed_log::KeyedLog;
pub use lock::DirectoryLock;
pub use record_log::{LogRecord, RecordIter, RecordLog, ScanReport, ScanStop, RECORD_MAGIC};
