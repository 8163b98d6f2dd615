//! AI Guardian core library
//!
//! Host agent that watches autonomous AI agent processes, classifies their
//! behavior, and contains them only with signed human approval.

pub mod api;
pub mod constants;
pub mod logic;
