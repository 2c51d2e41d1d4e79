//! Ports Layer - what the index builder needs from the outside
//!
//! The chain source is a driven port: a node RPC client, a block file
//! reader or the in-memory chain used by tests.

pub mod chain;

pub use chain::ChainSource;
