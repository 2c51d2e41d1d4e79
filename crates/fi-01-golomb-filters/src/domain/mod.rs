//! Domain Layer - filter codec and block extraction
//!
//! RULES:
//! - No I/O operations
//! - No async code
//! - Pure functions where possible

pub mod block_filter;
pub mod filter_model;
pub mod golomb;

pub use block_filter::{
    build_block_filter, build_script_filter, filter_key, is_indexed_script, witness_scripts,
};
pub use filter_model::FilterModel;
pub use golomb::{hash256, FilterKey, GolombRiceFilter, DEFAULT_P, MAX_P};
