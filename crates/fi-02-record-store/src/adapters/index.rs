//! # Hash Index
//!
//! A record log of `(key, offset)` pairs pointing into a data log.
//!
//! Entries are fixed size, so entry `i` always starts at
//! `i * ENTRY_FRAME_LEN`. When a key appears more than once the last entry
//! wins.

use std::collections::HashMap;
use std::path::Path;

use crate::adapters::record_log::{RecordLog, FRAME_OVERHEAD};
use crate::error::StorageError;
use crate::ports::RecordCodec;

/// 256-bit record key.
pub type Key = [u8; 32];

const ENTRY_BODY_LEN: usize = 36;

/// On-disk size of one index entry.
pub const ENTRY_FRAME_LEN: u64 = FRAME_OVERHEAD + ENTRY_BODY_LEN as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Key,
    pub offset: u32,
}

/// `key (32 bytes) | offset (u32 LE)`
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntryCodec;

impl RecordCodec for IndexEntryCodec {
    type Record = IndexEntry;

    fn encode(&self, entry: &IndexEntry, out: &mut Vec<u8>) {
        out.extend_from_slice(&entry.key);
        out.extend_from_slice(&entry.offset.to_le_bytes());
    }

    fn decode(&self, body: &[u8]) -> Result<IndexEntry, StorageError> {
        if body.len() != ENTRY_BODY_LEN {
            return Err(StorageError::Malformed(format!(
                "index entry is {} bytes, expected {ENTRY_BODY_LEN}",
                body.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&body[..32]);
        let offset = u32::from_le_bytes([body[32], body[33], body[34], body[35]]);
        Ok(IndexEntry { key, offset })
    }
}

/// Persistent index answering lookups by scanning the log.
pub struct Index {
    log: RecordLog<IndexEntryCodec>,
}

impl Index {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let log = RecordLog::open(path, IndexEntryCodec)?;
        Ok(Self { log })
    }

    pub fn append(&mut self, key: &Key, offset: u64) -> Result<(), StorageError> {
        let offset = u32::try_from(offset).map_err(|_| StorageError::OffsetOverflow { offset })?;
        self.log.append(&IndexEntry { key: *key, offset })?;
        Ok(())
    }

    /// Offset of the last entry for `key`.
    pub fn get(&mut self, key: &Key) -> Result<Option<u64>, StorageError> {
        Ok(self
            .log
            .read_from(0)?
            .filter(|entry| &entry.record.key == key)
            .last()
            .map(|entry| entry.record.offset as u64))
    }

    /// Entries from position `from` on, in append order.
    pub fn entries_from(&mut self, from: u64) -> Result<Vec<IndexEntry>, StorageError> {
        let start = from.saturating_mul(ENTRY_FRAME_LEN).min(self.log.len());
        Ok(self.log.read_from(start)?.map(|entry| entry.record).collect())
    }

    pub fn entries(&mut self) -> Result<Vec<IndexEntry>, StorageError> {
        self.entries_from(0)
    }

    /// Keep only the first `count` entries.
    pub fn truncate(&mut self, count: u64) -> Result<(), StorageError> {
        let len = count.saturating_mul(ENTRY_FRAME_LEN).min(self.log.len());
        self.log.truncate(len)
    }

    /// Number of entries, tombstoned records included.
    pub fn len(&self) -> u64 {
        self.log.len() / ENTRY_FRAME_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.log.sync()
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

/// [`Index`] with every entry mirrored into a hash map.
pub struct CachedIndex {
    index: Index,
    offsets: HashMap<Key, u64>,
    /// Earlier offsets of keys appended more than once, oldest first.
    shadowed: HashMap<Key, Vec<u64>>,
}

impl CachedIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut index = Index::open(path)?;
        let entries = index.entries()?;
        let mut cached = Self {
            index,
            offsets: HashMap::with_capacity(entries.len()),
            shadowed: HashMap::new(),
        };
        for entry in entries {
            cached.remember(entry.key, entry.offset as u64);
        }
        Ok(cached)
    }

    fn remember(&mut self, key: Key, offset: u64) {
        if let Some(previous) = self.offsets.insert(key, offset) {
            self.shadowed.entry(key).or_default().push(previous);
        }
    }

    pub fn get(&self, key: &Key) -> Option<u64> {
        self.offsets.get(key).copied()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.offsets.contains_key(key)
    }

    pub fn append(&mut self, key: &Key, offset: u64) -> Result<(), StorageError> {
        self.index.append(key, offset)?;
        self.remember(*key, offset);
        Ok(())
    }

    pub fn entries(&mut self) -> Result<Vec<IndexEntry>, StorageError> {
        self.index.entries()
    }

    /// Keep the first `count` entries. A key dropped this way points at its
    /// last surviving entry again, or is forgotten if it has none.
    pub fn truncate(&mut self, count: u64) -> Result<(), StorageError> {
        let dropped = self.index.entries_from(count)?;
        self.index.truncate(count)?;

        for entry in dropped.into_iter().rev() {
            let previous = match self.shadowed.get_mut(&entry.key) {
                Some(earlier) => {
                    let previous = earlier.pop();
                    if earlier.is_empty() {
                        self.shadowed.remove(&entry.key);
                    }
                    previous
                }
                None => None,
            };
            match previous {
                Some(offset) => self.offsets.insert(entry.key, offset),
                None => self.offsets.remove(&entry.key),
            };
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.index.sync()
    }

    pub fn path(&self) -> &Path {
        self.index.path()
    }
}
