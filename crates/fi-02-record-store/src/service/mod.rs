//! Service Layer - the two repositories built on the keyed logs

pub mod filter_repository;
pub mod utxo_repository;

pub use filter_repository::{FilterRepository, FILTER_DATA_FILE, FILTER_INDEX_FILE};
pub use utxo_repository::UtxoRepository;
