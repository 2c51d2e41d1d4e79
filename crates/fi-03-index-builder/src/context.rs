//! Everything the index builder needs, passed in explicitly.

use std::sync::Arc;

use crate::config::IndexerConfig;
use crate::ports::ChainSource;

pub struct IndexerContext<S: ChainSource> {
    pub config: IndexerConfig,
    pub chain: Arc<S>,
}

impl<S: ChainSource> IndexerContext<S> {
    pub fn new(config: IndexerConfig, chain: Arc<S>) -> Self {
        Self { config, chain }
    }
}
