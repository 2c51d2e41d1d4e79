//! The scan task.
//!
//! Owns both repositories while it runs and hands them back when it
//! exits. It is the only writer of the in-memory filter index.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, ScriptBuf};
use fi_01_golomb_filters::{build_script_filter, FilterModel, GolombRiceFilter};
use fi_02_record_store::{FilterRepository, UtxoRepository};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::FailurePolicy;
use crate::domain::{created_outputs, spent_outpoints, IndexEvent, ServiceState, StateCell};
use crate::error::IndexerError;
use crate::ports::ChainSource;

pub(crate) struct Stores {
    pub filters: FilterRepository,
    pub utxos: UtxoRepository,
}

enum Step {
    Indexed,
    Reorged,
    /// The next block is not mined yet.
    Waiting,
}

pub(crate) struct ScanWorker<S: ChainSource> {
    pub chain: Arc<S>,
    pub filter_p: u8,
    pub start_height: u32,
    pub retry_delay: Duration,
    pub prefetch_depth: u32,
    pub failure: FailurePolicy,
    pub index: Arc<RwLock<Vec<FilterModel>>>,
    pub state: Arc<StateCell>,
    pub events: broadcast::Sender<IndexEvent>,
    pub shutdown: watch::Receiver<bool>,
    pub stores: Stores,
    pub prefetched: VecDeque<(u32, Block)>,
}

impl<S: ChainSource> ScanWorker<S> {
    pub async fn run(mut self) -> Stores {
        info!(start_height = self.start_height, "Scan loop started");
        let mut failures = 0u32;

        while !self.stop_requested() {
            match self.step().await {
                Ok(Step::Waiting) => {
                    failures = 0;
                    self.pause(self.retry_delay).await;
                }
                Ok(Step::Indexed | Step::Reorged) => failures = 0,
                Err(e) => {
                    failures += 1;
                    self.prefetched.clear();
                    error!(error = %e, failures, "Scan iteration failed");

                    if self.failure.should_halt(failures) {
                        let reason = e.to_string();
                        error!(failures, %reason, "Halting scan loop");
                        let _ = self.events.send(IndexEvent::Halted { reason });
                        break;
                    }
                    self.pause(self.failure.backoff(failures)).await;
                }
            }
        }

        self.state.set(ServiceState::Stopped);
        info!("Scan loop stopped");
        self.stores
    }

    fn stop_requested(&self) -> bool {
        // A dropped sender also means stop.
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn step(&mut self) -> Result<Step, IndexerError> {
        let tip = self
            .index
            .read()
            .await
            .last()
            .map(|m| (m.block_height, m.block_hash));
        let height = match tip {
            Some((height, _)) => height.checked_add(1).ok_or(IndexerError::HeightOverflow {
                height: u64::from(height) + 1,
            })?,
            None => self.start_height,
        };

        let Some(block) = self.next_block(height).await? else {
            return Ok(Step::Waiting);
        };

        if let Some((tip_height, tip_hash)) = tip {
            if block.header.prev_blockhash != tip_hash {
                info!(
                    height = tip_height,
                    block_hash = %tip_hash,
                    "Reorg detected, rolling back tip"
                );
                self.prefetched.clear();
                self.roll_back_tip().await?;
                return Ok(Step::Reorged);
            }
        }

        self.index_block(height, &block).await?;
        Ok(Step::Indexed)
    }

    async fn next_block(&mut self, height: u32) -> Result<Option<Block>, IndexerError> {
        if self.prefetched.front().is_some_and(|(h, _)| *h != height) {
            self.prefetched.clear();
        }
        if self.prefetched.is_empty() {
            if self.prefetch_depth <= 1 {
                return Ok(self.chain.block(height).await?);
            }
            let batch = self.chain.blocks(height, self.prefetch_depth).await?;
            self.prefetched.extend(
                batch
                    .into_iter()
                    .enumerate()
                    .map(|(i, block)| (height.saturating_add(i as u32), block)),
            );
        }
        Ok(self.prefetched.pop_front().map(|(_, block)| block))
    }

    /// Drop the tip: tombstone its filter and revert its unspent-output
    /// changes, holding the write lock throughout.
    async fn roll_back_tip(&mut self) -> Result<(), IndexerError> {
        let mut index = self.index.write().await;
        let Some(tip) = index.last() else {
            return Ok(());
        };
        let (height, block_hash) = (tip.block_height, tip.block_hash);

        self.stores.filters.delete(&block_hash.to_byte_array())?;
        if !self.stores.utxos.revert_to_checkpoint()? {
            warn!(
                height,
                %block_hash,
                "No checkpoint left, unspent outputs of the dropped block remain"
            );
        }
        index.pop();
        drop(index);

        info!(height, %block_hash, "Rolled back block");
        let _ = self.events.send(IndexEvent::Reorged(block_hash));
        Ok(())
    }

    async fn index_block(&mut self, height: u32, block: &Block) -> Result<(), IndexerError> {
        let block_hash = block.block_hash();
        let key = block_hash.to_byte_array();

        let filter = match self.apply_block(&block_hash, block) {
            Ok(filter) => filter,
            Err(e) => {
                self.abandon_block(&block_hash, false);
                return Err(e);
            }
        };
        if let Err(e) = self.stores.filters.append(&key, &filter) {
            self.abandon_block(&block_hash, false);
            return Err(e.into());
        }
        if let Err(e) = self.stores.utxos.checkpoint_tagged(key) {
            self.abandon_block(&block_hash, true);
            return Err(e.into());
        }

        let entries = filter.n();
        self.index
            .write()
            .await
            .push(FilterModel::new(height, block_hash, Some(filter)));

        debug!(height, %block_hash, entries, "Indexed block");
        let _ = self.events.send(IndexEvent::BlockIndexed { height, block_hash });
        Ok(())
    }

    /// Apply `block` to the unspent-output set and build its filter over
    /// every script it created or spent.
    fn apply_block(
        &mut self,
        block_hash: &BlockHash,
        block: &Block,
    ) -> Result<GolombRiceFilter, IndexerError> {
        let mut scripts: BTreeSet<ScriptBuf> = BTreeSet::new();
        for tx in &block.txdata {
            for record in created_outputs(tx) {
                self.stores.utxos.append(&record)?;
                scripts.insert(record.script);
            }
            for outpoint in spent_outpoints(tx) {
                if let Some(spent) = self.stores.utxos.delete(&outpoint)? {
                    scripts.insert(spent.script);
                }
            }
        }
        Ok(build_script_filter(block_hash, self.filter_p, &scripts)?)
    }

    /// Undo whatever part of a failed block reached the repositories.
    fn abandon_block(&mut self, block_hash: &BlockHash, filter_stored: bool) {
        if let Err(e) = self.stores.utxos.rollback_pending() {
            error!(%block_hash, error = %e, "Could not roll back partial block");
        }
        if !filter_stored {
            return;
        }
        match self.stores.filters.delete(&block_hash.to_byte_array()) {
            Ok(true) => debug!(%block_hash, "Removed filter of failed block"),
            Ok(false) => {}
            Err(e) => error!(%block_hash, error = %e, "Could not remove filter of failed block"),
        }
    }
}
