pub mod controller;
pub mod listing;
pub mod runner;

#[cfg(test)]
pub(crate) mod fakes;

// Re-export common types
pub use controller::{ControlError, JobController};
pub use runner::{CycleRunner, RunOptions};
