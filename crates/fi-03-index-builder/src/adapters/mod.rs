//! Adapters Layer - chain sources

pub mod memory_chain;

pub use memory_chain::MemoryChain;
