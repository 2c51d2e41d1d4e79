//! Data log paired with its cached hash index.
//!
//! On open the pair is reconciled: index entries pointing past the data
//! are dropped and data with no index entry is cut off. Afterwards every
//! index entry points at a readable record and the last entry's record
//! ends the data log.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::adapters::index::{CachedIndex, IndexEntry, Key};
use crate::adapters::record_log::{LogRecord, RecordIter, RecordLog};
use crate::error::StorageError;
use crate::ports::RecordCodec;

pub struct KeyedLog<C: RecordCodec> {
    data: RecordLog<C>,
    index: CachedIndex,
}

impl<C: RecordCodec> KeyedLog<C> {
    pub fn open(
        data_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        codec: C,
    ) -> Result<Self, StorageError> {
        let data = RecordLog::open(data_path, codec)?;
        let index = CachedIndex::open(index_path)?;
        let mut log = Self { data, index };
        log.reconcile()?;
        Ok(log)
    }

    fn reconcile(&mut self) -> Result<(), StorageError> {
        let entries = self.index.entries()?;
        let mut keep = entries.len();

        // Offsets grow with the entry position.
        while keep > 0 {
            let offset = entries[keep - 1].offset as u64;
            if offset < self.data.len() {
                match self.data.read_record_at(offset) {
                    Ok(_) => break,
                    Err(StorageError::Corrupt { reason, .. }) => {
                        warn!(offset, %reason, "Index entry points at a bad record");
                    }
                    Err(e) => return Err(e),
                }
            }
            keep -= 1;
        }

        if keep < entries.len() {
            warn!(
                index = %self.index.path().display(),
                dropped = entries.len() - keep,
                "Dropping index entries without data"
            );
            self.index.truncate(keep as u64)?;
        }

        let data_end = match keep.checked_sub(1).map(|i| entries[i].offset as u64) {
            Some(offset) => {
                let last = self.data.read_record_at(offset)?;
                offset + last.len
            }
            None => 0,
        };
        if data_end < self.data.len() {
            warn!(
                data = %self.data.path().display(),
                dropped = self.data.len() - data_end,
                "Truncating unindexed data"
            );
            self.data.truncate(data_end)?;
        }
        Ok(())
    }

    /// Append `record` under `key`, returning its offset.
    pub fn append(&mut self, key: &Key, record: &C::Record) -> Result<u64, StorageError> {
        let offset = self.data.append(record)?;
        if let Err(e) = self.index.append(key, offset) {
            if let Err(cut) = self.data.truncate(offset) {
                warn!(
                    data = %self.data.path().display(),
                    offset,
                    error = %cut,
                    "Could not drop unindexed record"
                );
            }
            return Err(e);
        }
        Ok(offset)
    }

    pub fn offset_of(&self, key: &Key) -> Option<u64> {
        self.index.get(key)
    }

    /// Record stored under `key`, tombstones included.
    pub fn get(&mut self, key: &Key) -> Result<Option<LogRecord<C::Record>>, StorageError> {
        match self.index.get(key) {
            Some(offset) => self.data.read_record_at(offset).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_at(&mut self, offset: u64) -> Result<C::Record, StorageError> {
        self.data.read_at(offset)
    }

    pub fn write_at(&mut self, offset: u64, record: &C::Record) -> Result<(), StorageError> {
        self.data.write_at(offset, record)
    }

    pub fn records(&mut self) -> Result<RecordIter<'_, C>, StorageError> {
        self.data.read_from(0)
    }

    pub fn entries(&mut self) -> Result<Vec<IndexEntry>, StorageError> {
        self.index.entries()
    }

    /// Cut both logs back to `data_len` bytes and `entry_count` entries.
    pub fn truncate(&mut self, data_len: u64, entry_count: u64) -> Result<(), StorageError> {
        self.index.truncate(entry_count)?;
        self.data.truncate(data_len)
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.data.sync()?;
        self.index.sync()
    }

    pub fn data_len(&self) -> u64 {
        self.data.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.index.len()
    }

    pub fn data_path(&self) -> &Path {
        self.data.path()
    }

    pub fn index_path(&self) -> &Path {
        self.index.path()
    }

    pub fn codec(&self) -> &C {
        self.data.codec()
    }
}

/// `<base><suffix>`, keeping any dots already in the file name.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copy a data/index pair to `-read` siblings and return the copies.
///
/// The copies can be opened by a reader while the writer keeps going.
pub fn copy_snapshot(data_path: &Path, index_path: &Path) -> Result<(PathBuf, PathBuf), StorageError> {
    let snapshot = |path: &Path| -> Result<PathBuf, StorageError> {
        let stem = path
            .file_stem()
            .ok_or_else(|| StorageError::invalid(format!("{} has no file name", path.display())))?
            .to_string_lossy()
            .into_owned();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let target = path.with_file_name(format!("{stem}-read{ext}"));
        fs::copy(path, &target)?;
        Ok(target)
    };

    // Index first, so a racing append only leaves unindexed data behind.
    let index = snapshot(index_path)?;
    let data = snapshot(data_path)?;
    info!(data = %data.display(), "Copied read snapshot");
    Ok((data, index))
}
