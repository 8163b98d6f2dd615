//! Audit Ledger - Tamper-evident record of every agent decision
//!
//! # Components
//! - `types.rs`: entries, events, errors
//! - `chain.rs`: hash chain sealing and verification
//! - `storage.rs`: file and memory backends
//! - `journal.rs`: the ledger itself (single writer, concurrent readers)

pub mod chain;
pub mod journal;
pub mod storage;
pub mod types;


pub use chain::{verify_chain, GENESIS_HASH};
pub use journal::{Ledger, LedgerStatus, PeerNotifier};
pub use storage::{FileStorage, LedgerStorage, MemoryStorage};
pub use types::{AuditEntry, AuditEvent, LedgerConfig, LedgerError};
