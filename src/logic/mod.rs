//! Logic Module - Business Logic & Engines
//!
//! - `observer/` - Process sampling (sysinfo + procfs)
//! - `classifier/` - Behavioral pattern detection over observation windows
//! - `lifecycle/` - Per-subject threat state machine
//! - `authorization/` - Signed human approval of containment
//! - `response/` - Containment executor and quarantine vault
//! - `ledger/` - Hash-chained audit ledger
//! - `engine/` - Sampling loop tying the above together

pub mod alerts;
pub mod authorization;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod lifecycle;
pub mod observer;
pub mod response;

#[cfg(test)]
pub mod testing;
