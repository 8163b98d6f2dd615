//! API Module
//!
//! Read-only operator surface. The guardian has no UI; the report is
//! written to disk every cycle and read by whatever tooling the operator
//! uses.

pub mod report;

pub use report::OperatorReport;
