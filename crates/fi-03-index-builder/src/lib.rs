//! # FI-03 Index Builder
//!
//! Scans a chain into per-block Golomb-Rice filters and keeps the set of
//! unspent witness outputs those filters are built from.
//!
//! ## Architecture
//!
//! - **Domain Layer** (`domain/`)
//!   - `ServiceState`: `NotStarted -> Running -> Stopping -> Stopped`
//!   - `IndexEvent`: `Reorged`, `BlockIndexed`, `Halted`
//!   - `created_outputs` / `spent_outpoints`: a transaction's effect on the set
//!
//! - **Ports Layer** (`ports/`): `ChainSource`, blocks by height
//!
//! - **Adapters Layer** (`adapters/`): `MemoryChain` for tests and demos
//!
//! - **Service Layer** (`service/`): `IndexBuilderService`, one scan task
//!   owning both repositories
//!
//! ## Usage Example
//!
//! ```ignore
//! use fi_03_index_builder::{IndexBuilderService, IndexerConfig, IndexerContext};
//!
//! let ctx = IndexerContext::new(IndexerConfig::load("indexer.json")?, Arc::new(rpc));
//! let mut service = IndexBuilderService::new(ctx)?;
//! let mut events = service.subscribe();
//! service.synchronize()?;
//!
//! let (lines, found) = service.filter_lines_excluding(&wallet_tip).await;
//!
//! service.close().await?;
//! ```

pub mod adapters;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

pub use adapters::MemoryChain;
pub use config::{FailurePolicy, IndexerConfig};
pub use context::IndexerContext;
pub use domain::{IndexEvent, ServiceState};
pub use error::{ChainError, ConfigError, IndexerError};
pub use ports::ChainSource;
pub use service::IndexBuilderService;
