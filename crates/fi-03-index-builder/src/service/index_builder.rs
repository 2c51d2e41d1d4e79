//! # Index Builder Service
//!
//! Walks the chain block by block. For every block it updates the witness
//! output set, builds a filter over the scripts the block created or
//! spent, persists both, and appends a [`FilterModel`] to the in-memory
//! index that `filter_lines_excluding` serves.
//!
//! When a fetched block does not build on the indexed tip, the tip is
//! rolled back one block per iteration until the two chains agree. Every
//! rollback step publishes one [`IndexEvent::Reorged`].
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted --synchronize--> Running --stop--> Stopping --> Stopped
//!                                ^                              |
//!                                +---------synchronize----------+
//! ```

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use fi_01_golomb_filters::FilterModel;
use fi_02_record_store::{DirectoryLock, FilterRepository, UtxoRepository};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::IndexerConfig;
use crate::context::IndexerContext;
use crate::domain::{IndexEvent, ServiceState, StateCell};
use crate::error::IndexerError;
use crate::ports::ChainSource;
use crate::service::scan::{ScanWorker, Stores};

struct ScanTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Stores>,
}

pub struct IndexBuilderService<S: ChainSource + 'static> {
    config: IndexerConfig,
    chain: Arc<S>,
    start_height: u32,
    index: Arc<RwLock<Vec<FilterModel>>>,
    state: Arc<StateCell>,
    events: broadcast::Sender<IndexEvent>,
    /// Present while no scan task owns the repositories
    stores: Option<Stores>,
    task: Option<ScanTask>,
    _lock: DirectoryLock,
}

impl<S: ChainSource + 'static> IndexBuilderService<S> {
    /// Lock the data directory, open both repositories and reload the
    /// filter index from disk.
    pub fn new(ctx: IndexerContext<S>) -> Result<Self, IndexerError> {
        let IndexerContext { config, chain } = ctx;
        config.validate()?;
        let start_height = config.resolved_start_height()?;

        let lock = DirectoryLock::acquire(&config.network_dir())?;
        if config.should_wipe() {
            wipe(&config)?;
        }

        let mut filters = FilterRepository::open(config.filter_dir(), config.filter_p)?;
        let mut utxos = UtxoRepository::open(config.utxo_base(), config.utxo.clone())?;

        let mut index = Vec::new();
        for (i, (key, filter)) in filters.entries()?.into_iter().enumerate() {
            let height = u64::from(start_height) + i as u64;
            let height =
                u32::try_from(height).map_err(|_| IndexerError::HeightOverflow { height })?;
            index.push(FilterModel::new(
                height,
                BlockHash::from_byte_array(key),
                Some(filter),
            ));
        }
        reconcile(&mut filters, &mut utxos, &mut index)?;

        info!(
            network = %config.network,
            dir = %config.network_dir().display(),
            start_height,
            indexed = index.len(),
            unspent = utxos.len(),
            "Index builder ready"
        );

        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            config,
            chain,
            start_height,
            index: Arc::new(RwLock::new(index)),
            state: Arc::new(StateCell::default()),
            events,
            stores: Some(Stores { filters, utxos }),
            task: None,
            _lock: lock,
        })
    }

    /// Start the scan task. Must be called inside a tokio runtime.
    pub fn synchronize(&mut self) -> Result<(), IndexerError> {
        let current = self.state.get();
        if !matches!(current, ServiceState::NotStarted | ServiceState::Stopped) {
            return Err(IndexerError::InvalidState(current));
        }
        let stores = self
            .stores
            .take()
            .ok_or(IndexerError::InvalidState(current))?;
        self.state.set(ServiceState::Running);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = ScanWorker {
            chain: Arc::clone(&self.chain),
            filter_p: self.config.filter_p,
            start_height: self.start_height,
            retry_delay: self.config.retry_delay(),
            prefetch_depth: self.config.prefetch_depth,
            failure: self.config.failure.clone(),
            index: Arc::clone(&self.index),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            shutdown: shutdown_rx,
            stores,
            prefetched: VecDeque::new(),
        };
        let handle = tokio::spawn(worker.run());
        self.task = Some(ScanTask { shutdown, handle });

        info!(network = %self.config.network, "Synchronization started");
        Ok(())
    }

    /// Ask the scan task to stop and wait until it has.
    ///
    /// An in-flight fetch or write completes first. The repositories are
    /// back in the service afterwards, so `synchronize` may be called again.
    pub async fn stop(&mut self) -> Result<(), IndexerError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        // Already Stopped if the loop halted by itself.
        let _ = self
            .state
            .transition(ServiceState::Running, ServiceState::Stopping);
        let _ = task.shutdown.send(true);

        let stores = task
            .handle
            .await
            .map_err(|e| IndexerError::Task(e.to_string()))?;
        self.stores = Some(stores);
        self.state.set(ServiceState::Stopped);

        info!("Synchronization stopped");
        Ok(())
    }

    /// Stop, then close both repositories.
    pub async fn close(mut self) -> Result<(), IndexerError> {
        self.stop().await?;
        if let Some(Stores { mut filters, utxos }) = self.stores.take() {
            filters.sync()?;
            utxos.close()?;
        }
        Ok(())
    }

    /// Serialized filter lines of every block after `best_known`.
    ///
    /// The flag is `false`, with no lines, when `best_known` is not indexed.
    pub async fn filter_lines_excluding(&self, best_known: &BlockHash) -> (Vec<String>, bool) {
        let index = self.index.read().await;
        match index.iter().position(|m| m.block_hash == *best_known) {
            Some(i) => (index[i + 1..].iter().map(FilterModel::to_line).collect(), true),
            None => (Vec::new(), false),
        }
    }

    /// Height and hash of the last indexed block.
    pub async fn tip(&self) -> Option<(u32, BlockHash)> {
        self.index
            .read()
            .await
            .last()
            .map(|m| (m.block_height, m.block_hash))
    }

    pub async fn best_height(&self) -> Option<u32> {
        self.tip().await.map(|(height, _)| height)
    }

    /// Copy of the in-memory index.
    pub async fn filters(&self) -> Vec<FilterModel> {
        self.index.read().await.clone()
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn start_height(&self) -> u32 {
        self.start_height
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// The unspent-output repository while no scan task is running.
    pub fn utxos(&mut self) -> Option<&mut UtxoRepository> {
        self.stores.as_mut().map(|s| &mut s.utxos)
    }

    /// The filter repository while no scan task is running.
    pub fn filter_repository(&mut self) -> Option<&mut FilterRepository> {
        self.stores.as_mut().map(|s| &mut s.filters)
    }
}

/// Bring the filter index and the unspent-output set back to the same block
/// after a stop that did not close the repositories.
///
/// Every checkpoint is tagged with its block hash. Filters past the tagged
/// block are dropped; checkpoints for blocks without a filter are reverted.
fn reconcile(
    filters: &mut FilterRepository,
    utxos: &mut UtxoRepository,
    index: &mut Vec<FilterModel>,
) -> Result<(), IndexerError> {
    while let Some(tag) = utxos.tip_tag() {
        if let Some(i) = index
            .iter()
            .rposition(|m| m.block_hash.to_byte_array() == tag)
        {
            for dropped in index.drain(i + 1..).rev() {
                warn!(
                    height = dropped.block_height,
                    block_hash = %dropped.block_hash,
                    "Dropping filter of a block whose outputs were not saved"
                );
                filters.delete(&dropped.block_hash.to_byte_array())?;
            }
            return Ok(());
        }

        warn!(
            block_hash = %BlockHash::from_byte_array(tag),
            "Reverting outputs of a block without a filter"
        );
        if !utxos.revert_to_checkpoint()? {
            break;
        }
    }
    Ok(())
}

/// Remove both repositories, keeping the lock file.
fn wipe(config: &IndexerConfig) -> Result<(), IndexerError> {
    remove_dir_if_exists(&config.filter_dir())?;

    let utxo_base = config.utxo_base();
    let prefix = utxo_base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for entry in fs::read_dir(config.network_dir())? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) && entry.path().is_file() {
            fs::remove_file(entry.path())?;
        }
    }

    info!(dir = %config.network_dir().display(), "Wiped index data");
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<(), IndexerError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryChain;
    use fi_02_record_store::StorageError;
    use tempfile::TempDir;

    fn service(dir: &TempDir, chain: &Arc<MemoryChain>) -> IndexBuilderService<MemoryChain> {
        let config = IndexerConfig::for_testing(dir.path());
        IndexBuilderService::new(IndexerContext::new(config, Arc::clone(chain))).unwrap()
    }

    #[tokio::test]
    async fn test_second_instance_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new());
        let _first = service(&dir, &chain);

        let config = IndexerConfig::for_testing(dir.path());
        let second = IndexBuilderService::new(IndexerContext::new(config, Arc::clone(&chain)));
        assert!(matches!(
            second,
            Err(IndexerError::Storage(StorageError::Locked { .. }))
        ));
    }

    #[tokio::test]
    async fn test_synchronize_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new());
        let mut service = service(&dir, &chain);

        service.synchronize().unwrap();
        assert!(matches!(
            service.synchronize(),
            Err(IndexerError::InvalidState(ServiceState::Running))
        ));
        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new());
        let mut service = service(&dir, &chain);

        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::NotStarted);
        assert!(service.utxos().is_some());
    }

    #[tokio::test]
    async fn test_unknown_hash_is_not_found() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(MemoryChain::new());
        let service = service(&dir, &chain);

        let (lines, found) = service
            .filter_lines_excluding(&BlockHash::all_zeros())
            .await;
        assert!(!found);
        assert!(lines.is_empty());
    }
}
