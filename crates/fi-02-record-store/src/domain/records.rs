//! Record types stored in the filter and unspent-output logs.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use fi_01_golomb_filters::GolombRiceFilter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapters::index::Key;

/// Outpoint written over a spent record. No real transaction has an
/// all-zero id.
pub fn tombstone_outpoint() -> OutPoint {
    OutPoint {
        txid: Txid::all_zeros(),
        vout: 0,
    }
}

/// A filter log record. Deleting a filter replaces it with a tombstone of
/// the same encoded length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredFilter {
    Filter(GolombRiceFilter),
    Tombstone { bit_len: u32 },
}

impl StoredFilter {
    /// Tombstone occupying the same space as `filter`.
    pub fn tombstone_for(filter: &GolombRiceFilter) -> Self {
        StoredFilter::Tombstone {
            bit_len: filter.bit_len(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, StoredFilter::Tombstone { .. })
    }

    pub fn into_filter(self) -> Option<GolombRiceFilter> {
        match self {
            StoredFilter::Filter(filter) => Some(filter),
            StoredFilter::Tombstone { .. } => None,
        }
    }
}

/// Unspent witness output: outpoint and its locking script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRecord {
    pub outpoint: OutPoint,
    pub script: ScriptBuf,
}

impl UtxoRecord {
    pub fn new(outpoint: OutPoint, script: ScriptBuf) -> Self {
        Self { outpoint, script }
    }

    pub fn is_tombstone(&self) -> bool {
        self.outpoint == tombstone_outpoint()
    }

    /// Same record with the outpoint zeroed. The script is kept so the
    /// encoded length does not change.
    pub fn to_tombstone(&self) -> Self {
        Self {
            outpoint: tombstone_outpoint(),
            script: self.script.clone(),
        }
    }

    pub fn key(&self) -> Key {
        outpoint_key(&self.outpoint)
    }
}

/// SHA-256 of the consensus encoding of `outpoint` (txid then LE vout).
pub fn outpoint_key(outpoint: &OutPoint) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(outpoint.txid.as_byte_array());
    hasher.update(outpoint.vout.to_le_bytes());
    hasher.finalize().into()
}
