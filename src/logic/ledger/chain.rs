//! Hash chain primitives
//!
//! Each entry hash covers the previous hash, its own sequence number and
//! timestamp, the event kind and the canonical payload.

use sha2::{Digest, Sha256};

use super::types::{AuditEntry, LedgerError};

/// `prev_hash` of the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn compute_hash(prev_hash: &str, seq: u64, recorded_at_ms: i64, kind: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(recorded_at_ms.to_be_bytes());
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build an entry linked to `prev_hash`
pub fn seal(seq: u64, recorded_at_ms: i64, kind: &str, payload: String, prev_hash: &str) -> AuditEntry {
    let hash = compute_hash(prev_hash, seq, recorded_at_ms, kind, &payload);
    AuditEntry {
        seq,
        recorded_at_ms,
        kind: kind.to_string(),
        payload,
        prev_hash: prev_hash.to_string(),
        hash,
    }
}

/// Check one entry against the expected predecessor hash
pub fn verify_link(entry: &AuditEntry, expected_prev: &str) -> Result<(), LedgerError> {
    if entry.prev_hash != expected_prev {
        return Err(LedgerError::ChainBroken {
            seq: entry.seq,
            reason: format!(
                "prev_hash {} does not match predecessor {}",
                short(&entry.prev_hash),
                short(expected_prev)
            ),
        });
    }
    let recomputed = compute_hash(
        &entry.prev_hash,
        entry.seq,
        entry.recorded_at_ms,
        &entry.kind,
        &entry.payload,
    );
    if recomputed != entry.hash {
        return Err(LedgerError::ChainBroken {
            seq: entry.seq,
            reason: format!(
                "stored hash {} does not match content hash {}",
                short(&entry.hash),
                short(&recomputed)
            ),
        });
    }
    Ok(())
}

/// Verify a contiguous run of entries that starts after `prev_hash` at `first_seq`
pub fn verify_segment(entries: &[AuditEntry], first_seq: u64, prev_hash: &str) -> Result<(), LedgerError> {
    let mut expected_prev = prev_hash.to_string();
    for (offset, entry) in entries.iter().enumerate() {
        let expected_seq = first_seq + offset as u64;
        if entry.seq != expected_seq {
            return Err(if entry.seq < expected_seq {
                LedgerError::DuplicateSequence(entry.seq)
            } else {
                LedgerError::OutOfOrder {
                    expected: expected_seq,
                    actual: entry.seq,
                }
            });
        }
        verify_link(entry, &expected_prev)?;
        expected_prev = entry.hash.clone();
    }
    Ok(())
}

/// Verify a full chain starting at genesis
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), LedgerError> {
    verify_segment(entries, 0, GENESIS_HASH)
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
