//! Indexed filter entry and its legacy line encoding
//!
//! Line format: `blockHash[:n:bitLength:hexData]`. The suffix is left out
//! when the block has no filter or an empty one.

use std::fmt;

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::block_filter::filter_key;
use super::golomb::{FilterKey, GolombRiceFilter, DEFAULT_P};
use crate::error::FilterError;

/// One entry of the ordered filter index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterModel {
    /// Block height
    pub block_height: u32,
    /// Block hash
    pub block_hash: BlockHash,
    /// Filter over the block's touched witness scripts
    pub filter: Option<GolombRiceFilter>,
}

impl FilterModel {
    pub fn new(block_height: u32, block_hash: BlockHash, filter: Option<GolombRiceFilter>) -> Self {
        Self {
            block_height,
            block_hash,
            filter,
        }
    }

    /// SipHash key for matching against this entry's filter.
    pub fn filter_key(&self) -> FilterKey {
        filter_key(&self.block_hash)
    }

    /// True if the block's filter probably contains `script`.
    pub fn matches(&self, script: &[u8]) -> bool {
        self.filter
            .as_ref()
            .is_some_and(|f| f.matches(&self.filter_key(), script))
    }

    pub fn to_line(&self) -> String {
        self.to_string()
    }

    /// Parse a line produced by [`FilterModel::to_line`] with the default P.
    pub fn from_line(line: &str, block_height: u32) -> Result<Self, FilterError> {
        Self::from_line_with_p(line, block_height, DEFAULT_P)
    }

    pub fn from_line_with_p(line: &str, block_height: u32, p: u8) -> Result<Self, FilterError> {
        parse_line(line, block_height, p)
            .inspect_err(|e| debug!(block_height, error = %e, "Rejected filter line"))
    }
}

fn parse_line(line: &str, block_height: u32, p: u8) -> Result<FilterModel, FilterError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(FilterError::MalformedLine("empty line".into()));
    }

    let parts: Vec<&str> = line.split(':').collect();
    let block_hash = parse_hash(parts[0])?;

    let filter = match parts.as_slice() {
        [_] => None,
        [_, n, bit_len, data] => {
            let n = parse_number(n, "entry count")?;
            let bit_len = parse_number(bit_len, "bit length")?;
            let data = hex::decode(data)
                .map_err(|e| FilterError::MalformedLine(format!("filter data: {e}")))?;
            Some(GolombRiceFilter::from_parts(n, p, bit_len, data)?)
        }
        _ => {
            return Err(FilterError::MalformedLine(format!(
                "expected 1 or 4 fields, found {}",
                parts.len()
            )))
        }
    };

    Ok(FilterModel {
        block_height,
        block_hash,
        filter,
    })
}

impl fmt::Display for FilterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.block_hash)?;
        match &self.filter {
            Some(filter) if !filter.is_empty() => write!(
                f,
                ":{}:{}:{}",
                filter.n(),
                filter.bit_len(),
                hex::encode(filter.data())
            ),
            _ => Ok(()),
        }
    }
}

fn parse_hash(s: &str) -> Result<BlockHash, FilterError> {
    s.parse()
        .map_err(|e| FilterError::MalformedLine(format!("block hash {s:?}: {e}")))
}

fn parse_number(s: &str, what: &str) -> Result<u32, FilterError> {
    s.parse()
        .map_err(|e| FilterError::MalformedLine(format!("{what} {s:?}: {e}")))
}
