//! Service lifecycle state

use std::sync::atomic::{AtomicU8, Ordering};

/// `NotStarted -> Running -> Stopping -> Stopped`, and back to `Running` on
/// the next `synchronize()`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::NotStarted,
            1 => ServiceState::Running,
            2 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

/// Lock-free state shared between the service handle and its scan task.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails with the actual state otherwise.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> Result<(), ServiceState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ServiceState::from_u8)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ServiceState::NotStarted)
    }
}
