//! # Unspent-Output Repository
//!
//! Witness outputs keyed by `sha256(outpoint)`, stored as `<base>.dat`
//! and `<base>.idx`.
//!
//! ## Checkpoints
//!
//! Changes between two `checkpoint()` calls form one undo interval.
//! `revert_to_checkpoint()` truncates both logs back to where the interval
//! began and rewrites the records it tombstoned, restoring the set exactly
//! as it was at the previous checkpoint.
//!
//! Every spend, checkpoint, revert and rollback is written to the journal
//! `<base>.chk` before the logs change, and a checkpoint returns only once
//! its journal entry is synced. Opening replays the journal and undoes
//! whatever the previous writer did after its last checkpoint.
//!
//! ## Packing
//!
//! Spent records stay in the log as tombstones until the number that no
//! checkpoint still needs exceeds `pack_threshold`. Packing writes the rest
//! and a matching journal to `<base>.pack.*`, marks the pack complete with
//! `<base>.pack.done`, then renames the files into place. A pack that was
//! marked complete is finished on the next open; any other is discarded.

use std::collections::HashSet;
use std::fs::{self, File};
use std::mem;
use std::path::{Path, PathBuf};

use bitcoin::OutPoint;
use tracing::{debug, info, warn};

use crate::adapters::keyed_log::{copy_snapshot, with_suffix};
use crate::adapters::{JournalCodec, Key, KeyedLog, RecordLog, UtxoCodec};
use crate::domain::{
    journal_entries, outpoint_key, Checkpoint, CheckpointStack, JournalEntry, JournalReplay,
    PendingInterval, RevertStep, SpentEntry, UtxoRecord, UtxoStoreConfig,
};
use crate::error::StorageError;

pub struct UtxoRepository {
    base: PathBuf,
    log: KeyedLog<UtxoCodec>,
    config: UtxoStoreConfig,
    tombstones: u64,
    checkpoints: CheckpointStack,
    pending: PendingInterval,
    /// `None` on snapshots
    journal: Option<RecordLog<JournalCodec>>,
}

impl UtxoRepository {
    /// Open or create the repository at `<base>.dat` / `<base>.idx`.
    pub fn open(base: impl AsRef<Path>, config: UtxoStoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let base = base.as_ref().to_path_buf();
        finish_pack(&base)?;
        let log = KeyedLog::open(
            with_suffix(&base, ".dat"),
            with_suffix(&base, ".idx"),
            UtxoCodec,
        )?;
        Self::from_log(base, log, config, true)
    }

    /// Open a `-read` copy of the repository at `base`.
    ///
    /// The copy starts without checkpoints and never writes a journal.
    pub fn open_snapshot(base: impl AsRef<Path>, config: UtxoStoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let base = base.as_ref();
        let (data, index) = copy_snapshot(&with_suffix(base, ".dat"), &with_suffix(base, ".idx"))?;
        let log = KeyedLog::open(data, index, UtxoCodec)?;
        Self::from_log(with_suffix(base, "-read"), log, config, false)
    }

    fn from_log(
        base: PathBuf,
        log: KeyedLog<UtxoCodec>,
        config: UtxoStoreConfig,
        journaled: bool,
    ) -> Result<Self, StorageError> {
        let pending = PendingInterval::starting_at(log.data_len(), log.entry_count());
        let mut repo = Self {
            base,
            log,
            config,
            tombstones: 0,
            checkpoints: CheckpointStack::new(),
            pending,
            journal: None,
        };
        if journaled {
            repo.attach_journal()?;
        }
        repo.tombstones = repo
            .log
            .records()?
            .filter(|r| r.record.is_tombstone())
            .count() as u64;

        info!(
            base = %repo.base.display(),
            records = repo.log.entry_count(),
            tombstones = repo.tombstones,
            checkpoints = repo.checkpoints.len(),
            "Opened unspent-output repository"
        );
        Ok(repo)
    }

    /// Replay `<base>.chk`, undo what the last writer left uncheckpointed
    /// and start a compact journal for the result.
    fn attach_journal(&mut self) -> Result<(), StorageError> {
        let path = with_suffix(&self.base, ".chk");
        let mut replay = JournalReplay::new(
            self.config.checkpoint_high_water,
            self.config.checkpoint_low_water,
        );
        let mut replayed = 0u64;
        {
            let mut journal = RecordLog::open(&path, JournalCodec)?;
            for entry in journal.read_from(0)? {
                replay.apply(entry.record);
                replayed += 1;
            }
        }

        let checkpoints = replay.checkpoints;
        let interval = replay.pending;
        let (data_len, entry_count) = (self.log.data_len(), self.log.entry_count());
        if replayed == 0 {
            debug!(path = %path.display(), "Starting a new checkpoint journal");
        } else if interval.data_len > data_len || interval.entry_count > entry_count {
            warn!(
                path = %path.display(),
                journal_len = interval.data_len,
                log_len = data_len,
                "Checkpoint journal does not match the log, starting without checkpoints"
            );
        } else {
            self.checkpoints = checkpoints;
            if interval.data_len < data_len || interval.entry_count < entry_count || !interval.spent.is_empty() {
                warn!(
                    base = %self.base.display(),
                    dropped_bytes = data_len - interval.data_len,
                    restored = interval.spent.len(),
                    "Rolling back changes made after the last checkpoint"
                );
                self.undo(interval.data_len, interval.entry_count, &interval.spent)?;
            }
        }

        self.pending = PendingInterval::starting_at(self.log.data_len(), self.log.entry_count());
        self.journal = Some(RecordLog::open(&path, JournalCodec)?);
        self.rewrite_journal()
    }

    /// Unspent record for `outpoint`.
    pub fn get(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, StorageError> {
        let key = outpoint_key(outpoint);
        Ok(self
            .log
            .get(&key)?
            .map(|found| found.record)
            .filter(|record| !record.is_tombstone() && record.outpoint == *outpoint))
    }

    /// Every unspent record in append order.
    pub fn get_all(&mut self) -> Result<Vec<UtxoRecord>, StorageError> {
        Ok(self
            .log
            .records()?
            .map(|r| r.record)
            .filter(|record| !record.is_tombstone())
            .collect())
    }

    /// Add an unspent record. Fails if its outpoint is already unspent.
    pub fn append(&mut self, record: &UtxoRecord) -> Result<u64, StorageError> {
        if record.is_tombstone() {
            return Err(StorageError::invalid(
                "the all-zero outpoint is reserved for tombstones",
            ));
        }
        let key = record.key();
        if let Some(offset) = self.log.offset_of(&key) {
            if !self.log.read_at(offset)?.is_tombstone() {
                return Err(StorageError::DuplicateKey {
                    key: hex::encode(key),
                });
            }
        }
        let offset = self.log.append(&key, record)?;
        self.pending.appended += 1;
        Ok(offset)
    }

    /// Mark `outpoint` spent and return the record it held.
    pub fn delete(&mut self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>, StorageError> {
        let key = outpoint_key(outpoint);
        let Some(found) = self.log.get(&key)? else {
            return Ok(None);
        };
        let record = found.record;
        if record.is_tombstone() || record.outpoint != *outpoint {
            return Ok(None);
        }

        let spent = SpentEntry {
            offset: found.offset,
            record: record.clone(),
        };
        self.write_journal(&JournalEntry::Spent(spent.clone()))?;
        self.log.write_at(found.offset, &record.to_tombstone())?;
        self.tombstones += 1;
        self.pending.spent.push(spent);

        self.pack()?;
        Ok(Some(record))
    }

    /// Close the current undo interval and make it durable.
    ///
    /// With nothing changed since the last call no new entry is pushed.
    pub fn checkpoint(&mut self) -> Result<(), StorageError> {
        self.commit(None)
    }

    /// [`checkpoint`](Self::checkpoint), labelling the new state with `tag`.
    pub fn checkpoint_tagged(&mut self, tag: Key) -> Result<(), StorageError> {
        self.commit(Some(tag))
    }

    fn commit(&mut self, tag: Option<Key>) -> Result<(), StorageError> {
        if !self.pending.is_dirty() && !self.checkpoints.is_empty() {
            self.write_journal(&JournalEntry::Repeat { tag })?;
            self.sync_journal()?;
            self.checkpoints.repeat_top(tag);
            return Ok(());
        }

        self.log.sync()?;
        let (data_len, entry_count) = (self.log.data_len(), self.log.entry_count());
        self.write_journal(&JournalEntry::Sealed {
            data_len,
            entry_count,
            tag,
        })?;
        self.sync_journal()?;

        let next = PendingInterval::starting_at(data_len, entry_count);
        let interval = mem::replace(&mut self.pending, next);
        let pruned = self.checkpoints.push(
            interval.seal(tag),
            self.config.checkpoint_high_water,
            self.config.checkpoint_low_water,
        );
        if pruned > 0 {
            debug!(pruned, kept = self.checkpoints.len(), "Pruned old checkpoints");
            self.rewrite_journal()?;
        }
        Ok(())
    }

    /// Undo everything since the second-to-last checkpoint.
    ///
    /// Returns `false` when no checkpoint is left.
    pub fn revert_to_checkpoint(&mut self) -> Result<bool, StorageError> {
        if self.pending.is_dirty() {
            warn!("Discarding changes made since the last checkpoint");
            self.rollback_pending()?;
        }
        if self.checkpoints.is_empty() {
            warn!(base = %self.base.display(), "No checkpoint left to revert to");
            return Ok(false);
        }

        self.write_journal(&JournalEntry::Reverted)?;
        self.sync_journal()?;
        match self.checkpoints.revert_step() {
            RevertStep::Empty => Ok(false),
            RevertStep::Repeat => Ok(true),
            RevertStep::Undo(checkpoint) => {
                if let Err(e) = self.undo(checkpoint.data_len, checkpoint.entry_count, &checkpoint.spent) {
                    self.checkpoints.restore(checkpoint);
                    if let Err(journal) = self.rewrite_journal() {
                        warn!(error = %journal, "Could not rewrite checkpoint journal");
                    }
                    return Err(e);
                }
                self.write_journal(&JournalEntry::RolledBack)?;
                self.sync_journal()?;
                self.pending =
                    PendingInterval::starting_at(self.log.data_len(), self.log.entry_count());
                debug!(
                    data_len = checkpoint.data_len,
                    restored = checkpoint.spent.len(),
                    "Reverted to checkpoint"
                );
                self.pack()?;
                Ok(true)
            }
        }
    }

    /// Undo changes made since the last checkpoint.
    pub fn rollback_pending(&mut self) -> Result<(), StorageError> {
        if !self.pending.is_dirty() {
            return Ok(());
        }
        let pending = mem::take(&mut self.pending);
        if let Err(e) = self.undo(pending.data_len, pending.entry_count, &pending.spent) {
            self.pending = pending;
            return Err(e);
        }
        self.pending = PendingInterval::starting_at(self.log.data_len(), self.log.entry_count());
        self.write_journal(&JournalEntry::RolledBack)?;
        self.sync_journal()
    }

    fn undo(
        &mut self,
        data_len: u64,
        entry_count: u64,
        spent: &[SpentEntry],
    ) -> Result<(), StorageError> {
        self.log.truncate(data_len, entry_count)?;
        for entry in spent.iter().rev() {
            // Records created in the interval went with the truncation.
            if entry.offset < data_len {
                self.log.write_at(entry.offset, &entry.record)?;
            }
        }
        self.log.sync()?;
        self.tombstones = self.tombstones.saturating_sub(spent.len() as u64);
        Ok(())
    }

    /// Pack if enough tombstones can be reclaimed.
    pub fn pack(&mut self) -> Result<bool, StorageError> {
        if self.reclaimable() <= self.config.pack_threshold {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Rewrite the logs without reclaimable tombstones.
    pub fn compact(&mut self) -> Result<(), StorageError> {
        let undoable: HashSet<u64> = self.undo_entries().map(|s| s.offset).collect();
        let pack_data = with_suffix(&self.base, ".pack.dat");
        let pack_index = with_suffix(&self.base, ".pack.idx");
        let pack_journal = with_suffix(&self.base, ".pack.chk");
        for path in [&pack_data, &pack_index, &pack_journal] {
            remove_if_exists(path)?;
        }

        let before = self.log.data_len();
        let mut moves: Vec<(u64, u64)> = Vec::new();
        let mut kept_tombstones = 0u64;
        let (new_len, new_count) = {
            let mut packed = KeyedLog::open(&pack_data, &pack_index, UtxoCodec)?;
            for entry in self.log.entries()? {
                let offset = entry.offset as u64;
                let record = self.log.read_at(offset)?;
                if record.is_tombstone() {
                    if !undoable.contains(&offset) {
                        continue;
                    }
                    kept_tombstones += 1;
                }
                moves.push((offset, packed.append(&entry.key, &record)?));
            }
            packed.sync()?;
            (packed.data_len(), packed.entry_count())
        };

        let mut checkpoints = self.checkpoints.clone();
        for checkpoint in checkpoints.iter_mut() {
            (checkpoint.data_len, checkpoint.entry_count) =
                remap_boundary(&moves, checkpoint.data_len, new_len, new_count);
            remap_spent(&moves, &mut checkpoint.spent)?;
        }
        let mut pending = self.pending.clone();
        (pending.data_len, pending.entry_count) =
            remap_boundary(&moves, pending.data_len, new_len, new_count);
        remap_spent(&moves, &mut pending.spent)?;

        let journaled = self.journal.is_some();
        if journaled {
            create_journal(&pack_journal, &checkpoints, &pending)?;
        }
        File::create(with_suffix(&self.base, ".pack.done"))?.sync_all()?;

        self.journal = None;
        swap_pack(&self.base)?;
        let (data, index) = (self.log.data_path().to_path_buf(), self.log.index_path().to_path_buf());
        self.log = KeyedLog::open(data, index, UtxoCodec)?;
        if journaled {
            self.journal = Some(RecordLog::open(with_suffix(&self.base, ".chk"), JournalCodec)?);
        }

        self.checkpoints = checkpoints;
        self.pending = pending;
        self.tombstones = kept_tombstones;

        info!(
            base = %self.base.display(),
            before,
            after = new_len,
            records = new_count,
            "Packed unspent-output log"
        );
        Ok(())
    }

    /// Roll back uncheckpointed changes, pack if worthwhile and flush.
    pub fn close(mut self) -> Result<(), StorageError> {
        if self.pending.is_dirty() {
            warn!("Closing with changes after the last checkpoint, rolling them back");
            self.rollback_pending()?;
        }
        self.pack()?;
        self.log.sync()?;
        self.sync_journal()?;
        debug!(base = %self.base.display(), checkpoints = self.checkpoints.len(), "Closed unspent-output repository");
        Ok(())
    }

    /// Unspent record count.
    pub fn len(&self) -> u64 {
        self.log.entry_count().saturating_sub(self.tombstones)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstones(&self) -> u64 {
        self.tombstones
    }

    pub fn checkpoint_depth(&self) -> usize {
        self.checkpoints.len()
    }

    /// Tag of the latest checkpoint still on the stack.
    pub fn tip_tag(&self) -> Option<Key> {
        self.checkpoints.top_tag()
    }

    pub fn data_len(&self) -> u64 {
        self.log.data_len()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn write_journal(&mut self, entry: &JournalEntry) -> Result<(), StorageError> {
        if let Some(journal) = self.journal.as_mut() {
            journal.append(entry)?;
        }
        Ok(())
    }

    fn sync_journal(&mut self) -> Result<(), StorageError> {
        match self.journal.as_mut() {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Replace the journal with the shortest one describing the current
    /// state.
    fn rewrite_journal(&mut self) -> Result<(), StorageError> {
        if self.journal.is_none() {
            return Ok(());
        }
        let path = with_suffix(&self.base, ".chk");
        let tmp = with_suffix(&self.base, ".chk.tmp");
        create_journal(&tmp, &self.checkpoints, &self.pending)?;
        self.journal = None;
        fs::rename(&tmp, &path)?;
        self.journal = Some(RecordLog::open(&path, JournalCodec)?);
        Ok(())
    }

    fn undo_entries(&self) -> impl Iterator<Item = &SpentEntry> {
        self.checkpoints
            .iter()
            .flat_map(|c: &Checkpoint| c.spent.iter())
            .chain(self.pending.spent.iter())
    }

    fn reclaimable(&self) -> u64 {
        self.tombstones
            .saturating_sub(self.undo_entries().count() as u64)
    }
}

/// New `(data_len, entry_count)` for a boundary at old offset `old_len`.
fn remap_boundary(moves: &[(u64, u64)], old_len: u64, new_len: u64, new_count: u64) -> (u64, u64) {
    let i = moves.partition_point(|(old, _)| *old < old_len);
    match moves.get(i) {
        Some((_, new)) => (*new, i as u64),
        None => (new_len, new_count),
    }
}

fn remap_spent(moves: &[(u64, u64)], spent: &mut [SpentEntry]) -> Result<(), StorageError> {
    for entry in spent {
        let i = moves
            .binary_search_by_key(&entry.offset, |(old, _)| *old)
            .map_err(|_| StorageError::Corrupt {
                offset: entry.offset,
                reason: "journalled record missing from pack".into(),
            })?;
        entry.offset = moves[i].1;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write a fresh journal at `path` that replays to `checkpoints` and
/// `pending`.
fn create_journal(
    path: &Path,
    checkpoints: &CheckpointStack,
    pending: &PendingInterval,
) -> Result<(), StorageError> {
    remove_if_exists(path)?;
    let mut journal = RecordLog::open(path, JournalCodec)?;
    for entry in journal_entries(checkpoints, pending) {
        journal.append(&entry)?;
    }
    journal.sync()
}

/// Move a completed pack over the live files. Repeating it after a crash
/// part way through finishes the job.
fn swap_pack(base: &Path) -> Result<(), StorageError> {
    for suffix in [".idx", ".chk", ".dat"] {
        let packed = with_suffix(base, &format!(".pack{suffix}"));
        if packed.exists() {
            fs::rename(&packed, with_suffix(base, suffix))?;
        }
    }
    remove_if_exists(&with_suffix(base, ".pack.done"))
}

/// Finish a pack an earlier process completed, or discard one it did not.
fn finish_pack(base: &Path) -> Result<(), StorageError> {
    if with_suffix(base, ".pack.done").exists() {
        warn!(base = %base.display(), "Finishing interrupted pack");
        return swap_pack(base);
    }
    for suffix in [".pack.idx", ".pack.dat", ".pack.chk"] {
        remove_if_exists(&with_suffix(base, suffix))?;
    }
    Ok(())
}
