//! # Filter Repository
//!
//! Filters in `filters.dat`, their keys in `filters.idx`. Deleting a filter
//! overwrites it with a tombstone of the same length; the index entry
//! stays.

use std::fs;
use std::path::{Path, PathBuf};

use fi_01_golomb_filters::{GolombRiceFilter, MAX_P};
use tracing::{debug, info, warn};

use crate::adapters::keyed_log::copy_snapshot;
use crate::adapters::{FilterCodec, Key, KeyedLog};
use crate::domain::StoredFilter;
use crate::error::StorageError;

pub const FILTER_DATA_FILE: &str = "filters.dat";
pub const FILTER_INDEX_FILE: &str = "filters.idx";

pub struct FilterRepository {
    dir: PathBuf,
    log: KeyedLog<FilterCodec>,
    live: u64,
}

impl FilterRepository {
    /// Open or create the repository in `dir` for filters with parameter `p`.
    pub fn open(dir: impl AsRef<Path>, p: u8) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let data = dir.join(FILTER_DATA_FILE);
        let index = dir.join(FILTER_INDEX_FILE);
        Self::open_files(dir, &data, &index, p)
    }

    /// Open a `-read` copy of the repository in `dir`.
    pub fn open_snapshot(dir: impl AsRef<Path>, p: u8) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        let (data, index) =
            copy_snapshot(&dir.join(FILTER_DATA_FILE), &dir.join(FILTER_INDEX_FILE))?;
        Self::open_files(dir, &data, &index, p)
    }

    fn open_files(dir: PathBuf, data: &Path, index: &Path, p: u8) -> Result<Self, StorageError> {
        if p == 0 || p > MAX_P {
            return Err(StorageError::invalid(format!("unsupported filter parameter P={p}")));
        }
        let mut log = KeyedLog::open(data, index, FilterCodec::new(p))?;
        let live = log
            .records()?
            .filter(|r| !r.record.is_tombstone())
            .count() as u64;

        info!(
            dir = %dir.display(),
            filters = live,
            entries = log.entry_count(),
            "Opened filter repository"
        );
        Ok(Self { dir, log, live })
    }

    /// Filter stored under `key`, checked against its content hash.
    ///
    /// Returns `None` when the key is unknown, the record is a tombstone,
    /// the read fails, or the stored data does not hash to `key`.
    pub fn get(&mut self, key: &Key) -> Option<GolombRiceFilter> {
        let offset = self.log.offset_of(key)?;
        let filter = match self.log.read_at(offset) {
            Ok(StoredFilter::Filter(filter)) => filter,
            Ok(StoredFilter::Tombstone { .. }) => return None,
            Err(e) => {
                warn!(offset, error = %e, "Filter read failed");
                return None;
            }
        };

        if &filter.content_hash() != key {
            debug!(offset, "Stored filter does not hash to its key");
            return None;
        }
        Some(filter)
    }

    /// Every live filter in append order, empty filters included.
    pub fn get_all(&mut self) -> Result<Vec<GolombRiceFilter>, StorageError> {
        Ok(self
            .log
            .records()?
            .filter_map(|r| r.record.into_filter())
            .collect())
    }

    /// Live `(key, filter)` pairs in append order.
    pub fn entries(&mut self) -> Result<Vec<(Key, GolombRiceFilter)>, StorageError> {
        let entries = self.log.entries()?;
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            if let StoredFilter::Filter(filter) = self.log.read_at(entry.offset as u64)? {
                live.push((entry.key, filter));
            }
        }
        Ok(live)
    }

    /// Append `filter` under `key`. A key may only be reused once its
    /// previous filter is deleted.
    pub fn append(&mut self, key: &Key, filter: &GolombRiceFilter) -> Result<u64, StorageError> {
        if let Some(offset) = self.log.offset_of(key) {
            if !self.log.read_at(offset)?.is_tombstone() {
                return Err(StorageError::invalid(format!(
                    "key {} already holds a filter",
                    hex::encode(key)
                )));
            }
        }
        let offset = self.log.append(key, &StoredFilter::Filter(filter.clone()))?;
        self.live += 1;
        Ok(offset)
    }

    /// Tombstone the filter under `key`. Returns `false` if there was none.
    pub fn delete(&mut self, key: &Key) -> Result<bool, StorageError> {
        let Some(offset) = self.log.offset_of(key) else {
            return Ok(false);
        };
        let filter = match self.log.read_at(offset)? {
            StoredFilter::Filter(filter) => filter,
            StoredFilter::Tombstone { .. } => return Ok(false),
        };

        self.log
            .write_at(offset, &StoredFilter::tombstone_for(&filter))?;
        self.live -= 1;
        debug!(offset, "Tombstoned filter");
        Ok(true)
    }

    /// Live filter count.
    pub fn len(&self) -> u64 {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Index entries, tombstones included.
    pub fn entry_count(&self) -> u64 {
        self.log.entry_count()
    }

    pub fn data_len(&self) -> u64 {
        self.log.data_len()
    }

    pub fn p(&self) -> u8 {
        self.log.codec().p()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.log.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fi_01_golomb_filters::DEFAULT_P;
    use tempfile::TempDir;

    fn filter(items: &[&[u8]]) -> GolombRiceFilter {
        GolombRiceFilter::build(&[0; 16], DEFAULT_P, items).unwrap()
    }

    #[test]
    fn test_get_checks_content_hash() {
        let dir = TempDir::new().unwrap();
        let mut repo = FilterRepository::open(dir.path(), DEFAULT_P).unwrap();
        let f = filter(&[b"a", b"b"]);

        repo.append(&[7; 32], &f).unwrap();
        assert_eq!(repo.get(&[7; 32]), None);

        let key = f.content_hash();
        repo.append(&key, &f).unwrap();
        assert_eq!(repo.get(&key), Some(f));
    }

    #[test]
    fn test_reused_live_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = FilterRepository::open(dir.path(), DEFAULT_P).unwrap();
        let f = filter(&[b"x"]);
        let key = f.content_hash();

        repo.append(&key, &f).unwrap();
        assert!(matches!(
            repo.append(&key, &f),
            Err(StorageError::InvalidArgument(_))
        ));

        assert!(repo.delete(&key).unwrap());
        repo.append(&key, &f).unwrap();
        assert_eq!(repo.get(&key), Some(f));
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.entry_count(), 2);
    }

    #[test]
    fn test_rejects_bad_parameter() {
        let dir = TempDir::new().unwrap();
        assert!(FilterRepository::open(dir.path(), 0).is_err());
        assert!(FilterRepository::open(dir.path(), 40).is_err());
    }
}
