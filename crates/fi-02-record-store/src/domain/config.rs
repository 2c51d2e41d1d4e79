//! Unspent-output store configuration

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Tunables for [`UtxoRepository`](crate::UtxoRepository).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UtxoStoreConfig {
    /// Pack once more tombstones than this have accumulated
    pub pack_threshold: u64,
    /// Checkpoint count that triggers pruning
    pub checkpoint_high_water: usize,
    /// Checkpoints kept after pruning
    pub checkpoint_low_water: usize,
}

impl Default for UtxoStoreConfig {
    fn default() -> Self {
        Self {
            pack_threshold: 100_000,
            checkpoint_high_water: 1_000,
            checkpoint_low_water: 200,
        }
    }
}

impl UtxoStoreConfig {
    /// Small limits so tests exercise packing and pruning.
    pub fn for_testing() -> Self {
        Self {
            pack_threshold: 8,
            checkpoint_high_water: 10,
            checkpoint_low_water: 4,
        }
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.pack_threshold == 0 {
            return Err(StorageError::invalid("pack_threshold cannot be 0"));
        }
        if self.checkpoint_low_water == 0 {
            return Err(StorageError::invalid("checkpoint_low_water cannot be 0"));
        }
        if self.checkpoint_low_water >= self.checkpoint_high_water {
            return Err(StorageError::invalid(format!(
                "checkpoint_low_water ({}) must be below checkpoint_high_water ({})",
                self.checkpoint_low_water, self.checkpoint_high_water
            )));
        }
        Ok(())
    }

    pub fn with_pack_threshold(mut self, threshold: u64) -> Self {
        self.pack_threshold = threshold;
        self
    }

    pub fn with_checkpoint_depth(mut self, high_water: usize, low_water: usize) -> Self {
        self.checkpoint_high_water = high_water;
        self.checkpoint_low_water = low_water;
        self
    }
}
