//! Block-level filter extraction
//!
//! Selects the witness, non-P2SH output scripts of a block and codes them
//! into a Golomb-Rice filter keyed by the block's own hash prefix.

use std::collections::BTreeSet;

use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Script, ScriptBuf};

use super::golomb::{FilterKey, GolombRiceFilter};
use crate::error::FilterError;

/// First 16 bytes of the block hash, as used for the SipHash key.
pub fn filter_key(block_hash: &BlockHash) -> FilterKey {
    let bytes = block_hash.as_byte_array();
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes[..16]);
    key
}

/// Whether an output script is indexed: a witness program that is not P2SH.
pub fn is_indexed_script(script: &Script) -> bool {
    script.is_witness_program() && !script.is_p2sh()
}

/// Distinct indexed output scripts created by `block`.
pub fn witness_scripts(block: &Block) -> BTreeSet<ScriptBuf> {
    block
        .txdata
        .iter()
        .flat_map(|tx| tx.output.iter())
        .filter(|out| is_indexed_script(&out.script_pubkey))
        .map(|out| out.script_pubkey.clone())
        .collect()
}

/// Build the filter for a block's created witness outputs.
///
/// Blocks without indexed outputs yield the empty filter.
pub fn build_block_filter(block: &Block, p: u8) -> Result<GolombRiceFilter, FilterError> {
    let scripts = witness_scripts(block);
    build_script_filter(&block.block_hash(), p, &scripts)
}

/// Build a filter over an arbitrary script set keyed by `block_hash`.
pub fn build_script_filter<'a, I>(
    block_hash: &BlockHash,
    p: u8,
    scripts: I,
) -> Result<GolombRiceFilter, FilterError>
where
    I: IntoIterator<Item = &'a ScriptBuf>,
{
    let key = filter_key(block_hash);
    GolombRiceFilter::build(&key, p, scripts.into_iter().map(|s| s.as_bytes()))
}
