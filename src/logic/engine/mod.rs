//! Guardian Engine
//!
//! Wires the observer, classifier, state machine, gateway and executor
//! into the sampling loop.

pub mod board;
pub mod guardian;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;

pub use board::SubjectBoard;
pub use guardian::{Guardian, Services};
pub use tracker::SubjectTracker;
pub use types::{CycleSummary, EngineError, SubjectSnapshot};
