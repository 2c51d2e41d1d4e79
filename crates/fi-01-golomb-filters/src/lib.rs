//! # FI-01 Golomb Filters
//!
//! Compact block filters for thin clients (BIP 158 style).
//!
//! ## Architecture
//!
//! - **Domain Layer** (`domain/`): Pure logic, no I/O
//!   - `GolombRiceFilter`: Golomb-Rice coded probabilistic set
//!   - `build_block_filter`: Witness output extraction for a block
//!   - `FilterModel`: Ordered index entry and legacy line format
//!
//! ## Invariants
//!
//! - No false negatives: every item a filter was built from matches it
//! - Same `(key, P, set of items)` always encodes to the same bytes
//! - `n == 0` is a valid filter that matches nothing
//!
//! ## Usage Example
//!
//! ```ignore
//! use fi_01_golomb_filters::{build_block_filter, filter_key, DEFAULT_P};
//!
//! let filter = build_block_filter(&block, DEFAULT_P)?;
//! let key = filter_key(&block.block_hash());
//! assert!(filter.matches(&key, my_script.as_bytes()));
//! ```

pub mod domain;
pub mod error;

pub use domain::{
    build_block_filter, build_script_filter, filter_key, hash256, is_indexed_script,
    witness_scripts, FilterKey, FilterModel, GolombRiceFilter, DEFAULT_P, MAX_P,
};
pub use error::FilterError;
