//! Domain Layer - lifecycle state, events and block bookkeeping

pub mod block_delta;
pub mod events;
pub mod state;

pub use block_delta::{created_outputs, spent_outpoints};
pub use events::IndexEvent;
pub use state::{ServiceState, StateCell};
