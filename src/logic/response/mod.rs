//! Containment Executor - Approved actions against subjects
//!
//! # Components
//! - `types.rs`: action records, quarantine entries, config
//! - `quarantine.rs`: the quarantine vault
//! - `executor.rs`: terminate / quarantine / restore

pub mod executor;
pub mod quarantine;
pub mod types;


pub use executor::ContainmentExecutor;
pub use quarantine::QuarantineVault;
pub use types::{ActionRecord, ActionStatus, ContainmentConfig, ContainmentError, QuarantineEntry, StopMethod};
