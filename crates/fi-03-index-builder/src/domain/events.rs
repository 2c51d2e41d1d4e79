//! Events published by the index builder.

use bitcoin::BlockHash;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexEvent {
    /// One block was rolled back. Carries the hash of the dropped block.
    Reorged(BlockHash),
    /// A block was indexed at `height`.
    BlockIndexed { height: u32, block_hash: BlockHash },
    /// The scan loop gave up after repeated failures.
    Halted { reason: String },
}
