//! Offline provenance check
//!
//! Re-verifies from ledger entries alone that every containment action
//! followed a durably recorded approval whose signature checks out against
//! the operator registry.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::keys::SignatureVerifier;
use super::types::{AuthorizationRequest, Decision, Verdict};
use crate::logic::classifier::Severity;
use crate::logic::ledger::{verify_chain, AuditEntry, AuditEvent};
use crate::logic::response::ContainmentConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvenanceError {
    #[error("ledger chain invalid: {0}")]
    Chain(String),

    #[error("entry {seq} is unreadable: {reason}")]
    Unreadable { seq: u64, reason: String },

    #[error("approval for nonce {nonce} has no recorded request")]
    MissingRequest { nonce: u64 },

    #[error("approval for nonce {nonce} does not verify: {reason}")]
    BadSignature { nonce: u64, reason: String },

    #[error("action at seq {seq} has no prior approval for nonce {nonce}")]
    Unapproved { seq: u64, nonce: u64 },

    #[error("action at seq {seq} does not match the request for nonce {nonce}")]
    Mismatch { seq: u64, nonce: u64 },

    #[error("action at seq {seq} was justified at {actual}, below the required {required}")]
    BelowThreshold {
        seq: u64,
        actual: Severity,
        required: Severity,
    },

    #[error("nonce {nonce} executed more than once")]
    Reused { nonce: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvenanceReport {
    pub approvals_verified: usize,
    pub actions_verified: usize,
}

/// `entries` must be the full ledger starting at seq 0
pub fn verify_provenance(
    entries: &[AuditEntry],
    verifier: &dyn SignatureVerifier,
    thresholds: &ContainmentConfig,
) -> Result<ProvenanceReport, ProvenanceError> {
    verify_chain(entries).map_err(|e| ProvenanceError::Chain(e.to_string()))?;

    let mut requests: HashMap<u64, AuthorizationRequest> = HashMap::new();
    let mut approvals: HashMap<u64, u64> = HashMap::new();
    let mut executed: HashSet<u64> = HashSet::new();
    let mut report = ProvenanceReport::default();

    for entry in entries {
        let event = entry.event().map_err(|e| ProvenanceError::Unreadable {
            seq: entry.seq,
            reason: e.to_string(),
        })?;

        match event {
            AuditEvent::AuthorizationSubmitted { request } => {
                requests.insert(request.nonce, request);
            }
            AuditEvent::AuthorizationDecided { record } if record.decision == Decision::Approved => {
                let request = requests
                    .get(&record.nonce)
                    .ok_or(ProvenanceError::MissingRequest { nonce: record.nonce })?;
                let bad = |reason: &str| ProvenanceError::BadSignature {
                    nonce: record.nonce,
                    reason: reason.to_string(),
                };
                let operator = record.operator_id.as_deref().ok_or_else(|| bad("no operator"))?;
                let signature = record.signature.as_deref().ok_or_else(|| bad("no signature"))?;
                verifier
                    .verify(operator, &request.signing_message(Verdict::Approve), signature)
                    .map_err(|e| bad(&e.to_string()))?;
                approvals.insert(record.nonce, entry.seq);
                report.approvals_verified += 1;
            }
            AuditEvent::ContainmentExecuted { record } => {
                let approval_seq = approvals.get(&record.nonce).ok_or(ProvenanceError::Unapproved {
                    seq: entry.seq,
                    nonce: record.nonce,
                })?;
                let request = requests.get(&record.nonce).ok_or(ProvenanceError::MissingRequest {
                    nonce: record.nonce,
                })?;
                if *approval_seq != record.approval_seq
                    || request.subject != record.subject
                    || request.action != record.action
                    || request.request_id != record.request_id
                {
                    return Err(ProvenanceError::Mismatch {
                        seq: entry.seq,
                        nonce: record.nonce,
                    });
                }
                let required = thresholds.min_severity(record.action);
                if request.justification.severity < required {
                    return Err(ProvenanceError::BelowThreshold {
                        seq: entry.seq,
                        actual: request.justification.severity,
                        required,
                    });
                }
                if !executed.insert(record.nonce) {
                    return Err(ProvenanceError::Reused { nonce: record.nonce });
                }
                report.actions_verified += 1;
            }
            _ => {}
        }
    }

    Ok(report)
}
