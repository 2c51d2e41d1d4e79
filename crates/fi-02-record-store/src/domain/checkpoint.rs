//! # Checkpoint Stack
//!
//! Each checkpoint closes an undo interval of the unspent-output log: the
//! log lengths when the interval began plus every record tombstoned
//! during it. Reverting truncates to those lengths and writes the
//! journalled records back.
//!
//! A checkpoint with nothing changed since the previous one adds no entry.
//! Its tag is pushed onto `repeats` of the top entry instead, so that every
//! `checkpoint()` still pairs with exactly one revert.
//!
//! ## Journal
//!
//! Every change to the stack is also written as a [`JournalEntry`].
//! Replaying the entries in order with [`JournalReplay`] rebuilds the stack
//! and the interval that was open when the writer stopped.

use std::collections::VecDeque;
use std::mem;

use serde::{Deserialize, Serialize};

use super::records::UtxoRecord;
use crate::adapters::index::Key;

/// A record tombstoned during an interval, with its original contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentEntry {
    pub offset: u64,
    pub record: UtxoRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Data log length when the interval began
    pub data_len: u64,
    /// Index entry count when the interval began
    pub entry_count: u64,
    /// Records tombstoned during the interval, oldest first
    pub spent: Vec<SpentEntry>,
    /// Caller's label for the state this checkpoint closed, a block hash
    pub tag: Option<Key>,
    /// Tags of the checkpoints taken after it with nothing changed
    pub repeats: Vec<Option<Key>>,
}

/// Changes since the last checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingInterval {
    pub data_len: u64,
    pub entry_count: u64,
    pub spent: Vec<SpentEntry>,
    pub appended: u64,
}

impl PendingInterval {
    pub fn starting_at(data_len: u64, entry_count: u64) -> Self {
        Self {
            data_len,
            entry_count,
            ..Self::default()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.appended > 0 || !self.spent.is_empty()
    }

    /// Close the interval into a checkpoint labelled `tag`.
    pub fn seal(self, tag: Option<Key>) -> Checkpoint {
        Checkpoint {
            data_len: self.data_len,
            entry_count: self.entry_count,
            spent: self.spent,
            tag,
            repeats: Vec::new(),
        }
    }
}

/// Outcome of one revert step.
#[derive(Debug, PartialEq, Eq)]
pub enum RevertStep {
    /// Nothing left to revert.
    Empty,
    /// An unchanged checkpoint was consumed.
    Repeat,
    /// Undo this interval.
    Undo(Checkpoint),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStack {
    entries: VecDeque<Checkpoint>,
}

impl CheckpointStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `checkpoint`, pruning to `low_water` entries once `high_water`
    /// is reached. Returns how many old entries were pruned.
    pub fn push(&mut self, checkpoint: Checkpoint, high_water: usize, low_water: usize) -> usize {
        self.entries.push_back(checkpoint);
        if self.entries.len() < high_water {
            return 0;
        }
        let pruned = self.entries.len().saturating_sub(low_water);
        self.entries.drain(..pruned);
        pruned
    }

    /// Count an unchanged checkpoint against the top entry.
    pub fn repeat_top(&mut self, tag: Option<Key>) -> bool {
        match self.entries.back_mut() {
            Some(top) => {
                top.repeats.push(tag);
                true
            }
            None => false,
        }
    }

    pub fn revert_step(&mut self) -> RevertStep {
        let Some(top) = self.entries.back_mut() else {
            return RevertStep::Empty;
        };
        if top.repeats.pop().is_some() {
            return RevertStep::Repeat;
        }
        match self.entries.pop_back() {
            Some(checkpoint) => RevertStep::Undo(checkpoint),
            None => RevertStep::Empty,
        }
    }

    /// Put back a checkpoint taken by `revert_step` whose undo failed.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.entries.push_back(checkpoint);
    }

    /// Tag of the most recent checkpoint.
    pub fn top_tag(&self) -> Option<Key> {
        let top = self.entries.back()?;
        match top.repeats.last() {
            Some(tag) => *tag,
            None => top.tag,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Checkpoint> {
        self.entries.iter_mut()
    }
}

/// One change to the checkpoint stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// First entry: the open interval begins at these log lengths.
    Start { data_len: u64, entry_count: u64 },
    /// Written before the record at `offset` is tombstoned.
    Spent(SpentEntry),
    /// The open interval was checkpointed. The next one begins at these
    /// log lengths.
    Sealed {
        data_len: u64,
        entry_count: u64,
        tag: Option<Key>,
    },
    /// Checkpoint with nothing changed.
    Repeat { tag: Option<Key> },
    /// One revert step. Written before the logs are touched.
    Reverted,
    /// The open interval has been undone on disk.
    RolledBack,
}

/// Rebuilds checkpoint state from journal entries.
///
/// After a `Reverted` entry the open interval holds the undone checkpoint
/// until the matching `RolledBack`, so an undo cut short is redone.
#[derive(Debug)]
pub struct JournalReplay {
    pub checkpoints: CheckpointStack,
    pub pending: PendingInterval,
    high_water: usize,
    low_water: usize,
}

impl JournalReplay {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        Self {
            checkpoints: CheckpointStack::new(),
            pending: PendingInterval::default(),
            high_water,
            low_water,
        }
    }

    pub fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Start {
                data_len,
                entry_count,
            } => self.pending = PendingInterval::starting_at(data_len, entry_count),
            JournalEntry::Spent(spent) => self.pending.spent.push(spent),
            JournalEntry::Sealed {
                data_len,
                entry_count,
                tag,
            } => {
                let next = PendingInterval::starting_at(data_len, entry_count);
                let interval = mem::replace(&mut self.pending, next);
                self.checkpoints
                    .push(interval.seal(tag), self.high_water, self.low_water);
            }
            JournalEntry::Repeat { tag } => {
                self.checkpoints.repeat_top(tag);
            }
            JournalEntry::Reverted => {
                if let RevertStep::Undo(checkpoint) = self.checkpoints.revert_step() {
                    self.pending = PendingInterval {
                        data_len: checkpoint.data_len,
                        entry_count: checkpoint.entry_count,
                        spent: checkpoint.spent,
                        appended: 0,
                    };
                }
            }
            JournalEntry::RolledBack => self.pending.spent.clear(),
        }
    }
}

/// Entries that replay to exactly `checkpoints` and `pending`.
pub fn journal_entries(checkpoints: &CheckpointStack, pending: &PendingInterval) -> Vec<JournalEntry> {
    let mut entries = Vec::new();
    let first = checkpoints.iter().next().map_or(
        (pending.data_len, pending.entry_count),
        |c| (c.data_len, c.entry_count),
    );
    entries.push(JournalEntry::Start {
        data_len: first.0,
        entry_count: first.1,
    });

    let starts: Vec<(u64, u64)> = checkpoints
        .iter()
        .skip(1)
        .map(|c| (c.data_len, c.entry_count))
        .chain([(pending.data_len, pending.entry_count)])
        .collect();
    for (checkpoint, (data_len, entry_count)) in checkpoints.iter().zip(starts) {
        entries.extend(checkpoint.spent.iter().cloned().map(JournalEntry::Spent));
        entries.push(JournalEntry::Sealed {
            data_len,
            entry_count,
            tag: checkpoint.tag,
        });
        entries.extend(checkpoint.repeats.iter().map(|&tag| JournalEntry::Repeat { tag }));
    }
    entries.extend(pending.spent.iter().cloned().map(JournalEntry::Spent));
    entries
}
