//! # In-Memory Chain
//!
//! A [`ChainSource`] over blocks held in memory, for tests and demos.
//! Blocks carry no proof of work; only the hash links matter.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::{
    transaction, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, WPubkeyHash, Witness,
};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::ChainError;
use crate::ports::ChainSource;

const GENESIS_TIME: u32 = 1_700_000_000;

pub struct MemoryChain {
    blocks: RwLock<Vec<Block>>,
    /// Calls left that fail with `ChainError::Unavailable`
    failures: AtomicU32,
    tag: AtomicU32,
}

impl MemoryChain {
    /// A chain holding only a genesis block.
    pub fn new() -> Self {
        let chain = Self {
            blocks: RwLock::new(Vec::new()),
            failures: AtomicU32::new(0),
            tag: AtomicU32::new(0),
        };
        chain.mine(Vec::new());
        chain
    }

    /// Height of the tip.
    pub fn height(&self) -> u32 {
        (self.blocks.read().len() as u32).saturating_sub(1)
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.blocks
            .read()
            .last()
            .map(Block::block_hash)
            .unwrap_or_else(BlockHash::all_zeros)
    }

    pub fn block_at(&self, height: u32) -> Option<Block> {
        self.blocks.read().get(height as usize).cloned()
    }

    /// Mine a block on the tip holding a fresh coinbase and `txs`.
    pub fn mine(&self, txs: Vec<Transaction>) -> Block {
        let mut blocks = self.blocks.write();
        let height = blocks.len() as u32;
        let prev = blocks
            .last()
            .map(Block::block_hash)
            .unwrap_or_else(BlockHash::all_zeros);
        let tag = self.tag.fetch_add(1, Ordering::Relaxed);

        let mut txdata = vec![coinbase(tag, vec![p2wpkh(height as u8)])];
        txdata.extend(txs);
        let mut block = Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: GENESIS_TIME + height * 600,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: tag,
            },
            txdata,
        };
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }

        debug!(height, block_hash = %block.block_hash(), "Mined block");
        blocks.push(block.clone());
        block
    }

    /// Mine `count` blocks with only a coinbase each.
    pub fn mine_empty(&self, count: u32) -> Vec<Block> {
        (0..count).map(|_| self.mine(Vec::new())).collect()
    }

    /// Drop the top `count` blocks and return them, highest first.
    pub fn invalidate_tip(&self, count: u32) -> Vec<Block> {
        let mut blocks = self.blocks.write();
        // Genesis stays.
        let keep = blocks.len().saturating_sub(count as usize).max(1);
        let mut dropped = blocks.split_off(keep);
        dropped.reverse();
        dropped
    }

    /// Make the next `calls` requests fail.
    pub fn fail_next(&self, calls: u32) {
        self.failures.store(calls, Ordering::Release);
    }

    fn check_failure(&self) -> Result<(), ChainError> {
        let injected = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(ChainError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainSource for MemoryChain {
    async fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError> {
        self.check_failure()?;
        Ok(self.block_at(height).map(|b| b.block_hash()))
    }

    async fn block(&self, height: u32) -> Result<Option<Block>, ChainError> {
        self.check_failure()?;
        Ok(self.block_at(height))
    }
}

/// Pay-to-witness-pubkey-hash script with a repeated-byte hash.
pub fn p2wpkh(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20]))
}

/// Coinbase paying `outputs`. `tag` keeps txids unique across blocks.
pub fn coinbase(tag: u32, outputs: Vec<ScriptBuf>) -> Transaction {
    let mut script_sig = vec![0x04];
    script_sig.extend_from_slice(&tag.to_le_bytes());
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs_of(outputs),
    }
}

/// Transaction spending `prevouts` into `outputs`.
pub fn spend(prevouts: &[OutPoint], outputs: Vec<ScriptBuf>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: prevouts
            .iter()
            .map(|prev| TxIn {
                previous_output: *prev,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs_of(outputs),
    }
}

fn outputs_of(scripts: Vec<ScriptBuf>) -> Vec<TxOut> {
    scripts
        .into_iter()
        .map(|script_pubkey| TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey,
        })
        .collect()
}
