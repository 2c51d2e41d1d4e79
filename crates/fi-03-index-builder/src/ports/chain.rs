//! Chain data source (Driven Port)

use async_trait::async_trait;
use bitcoin::{Block, BlockHash};
use futures::future::join_all;

use crate::error::ChainError;

/// Blocks of the best chain by height.
///
/// `Ok(None)` means the height is not mined yet. That is a normal
/// condition and the caller retries later.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError>;

    async fn block(&self, height: u32) -> Result<Option<Block>, ChainError>;

    /// Up to `count` blocks starting at `from`, fetched concurrently.
    ///
    /// Returns the available prefix: fetching stops at the first height
    /// that is not mined yet.
    async fn blocks(&self, from: u32, count: u32) -> Result<Vec<Block>, ChainError> {
        let fetches = (0..count)
            .map_while(|i| from.checked_add(i))
            .map(|height| self.block(height));

        let mut blocks = Vec::new();
        for result in join_all(fetches).await {
            match result? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }
}
