//! Ledger Types
//!
//! Audit entries, the events they carry, and ledger errors.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::logic::alerts::Alert;
use crate::logic::authorization::{AuthorizationRequest, DecisionRecord, SignedDecision};
use crate::logic::classifier::ThreatAssessment;
use crate::logic::lifecycle::{SubjectRecord, SubjectState, TransitionCause};
use crate::logic::observer::{Observation, SubjectId};
use crate::logic::response::ActionRecord;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Ledger file; `None` resolves to the data dir default
    pub path: Option<PathBuf>,
    /// Entries held in memory while storage is unavailable
    pub max_pending: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_pending: 4096,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Everything the agent writes to the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    SubjectDiscovered {
        subject: SubjectRecord,
    },
    ObservationRecorded {
        observation: Observation,
    },
    AssessmentProduced {
        assessment: ThreatAssessment,
    },
    ClassificationFault {
        subject: SubjectId,
        observation_seq: u64,
        reason: String,
    },
    StateTransition {
        subject: SubjectId,
        from: SubjectState,
        to: SubjectState,
        cause: TransitionCause,
    },
    LivenessFault {
        attempts: u32,
        reason: String,
    },
    AuthorizationSubmitted {
        request: AuthorizationRequest,
    },
    AuthorizationDecided {
        record: DecisionRecord,
    },
    AuthorizationResponseRejected {
        nonce: u64,
        reason: String,
        operator_id: Option<String>,
        signature: Option<String>,
    },
    ContainmentExecuted {
        record: ActionRecord,
    },
    QuarantineRestored {
        action_id: Uuid,
        subject: SubjectId,
        restored_to: PathBuf,
    },
    AlertRaised {
        alert: Alert,
    },
    SubjectArchived {
        subject: SubjectId,
        final_state: SubjectState,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::SubjectDiscovered { .. } => "subject_discovered",
            AuditEvent::ObservationRecorded { .. } => "observation_recorded",
            AuditEvent::AssessmentProduced { .. } => "assessment_produced",
            AuditEvent::ClassificationFault { .. } => "classification_fault",
            AuditEvent::StateTransition { .. } => "state_transition",
            AuditEvent::LivenessFault { .. } => "liveness_fault",
            AuditEvent::AuthorizationSubmitted { .. } => "authorization_submitted",
            AuditEvent::AuthorizationDecided { .. } => "authorization_decided",
            AuditEvent::AuthorizationResponseRejected { .. } => "authorization_response_rejected",
            AuditEvent::ContainmentExecuted { .. } => "containment_executed",
            AuditEvent::QuarantineRestored { .. } => "quarantine_restored",
            AuditEvent::AlertRaised { .. } => "alert_raised",
            AuditEvent::SubjectArchived { .. } => "subject_archived",
        }
    }

    /// Subject this event concerns, if any
    pub fn subject(&self) -> Option<SubjectId> {
        match self {
            AuditEvent::SubjectDiscovered { subject } => Some(subject.id),
            AuditEvent::ObservationRecorded { observation } => Some(observation.subject),
            AuditEvent::AssessmentProduced { assessment } => Some(assessment.subject),
            AuditEvent::ClassificationFault { subject, .. } => Some(*subject),
            AuditEvent::StateTransition { subject, .. } => Some(*subject),
            AuditEvent::AuthorizationSubmitted { request } => Some(request.subject),
            AuditEvent::AuthorizationDecided { record } => Some(record.subject),
            AuditEvent::ContainmentExecuted { record } => Some(record.subject),
            AuditEvent::QuarantineRestored { subject, .. } => Some(*subject),
            AuditEvent::AlertRaised { alert } => alert.subject,
            AuditEvent::SubjectArchived { subject, .. } => Some(*subject),
            AuditEvent::LivenessFault { .. } | AuditEvent::AuthorizationResponseRejected { .. } => {
                None
            }
        }
    }
}

// ============================================================================
// ENTRY
// ============================================================================

/// One sealed record in the hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at_ms: i64,
    pub kind: String,
    /// Canonical JSON of the [`AuditEvent`]; hashed as stored
    pub payload: String,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditEntry {
    pub fn event(&self) -> Result<AuditEvent, LedgerError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.recorded_at_ms)
            .single()
            .unwrap_or_default()
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("ledger buffer full ({0} entries awaiting storage)")]
    BufferFull(usize),

    #[error("out-of-order append: expected seq {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("duplicate sequence number {0}")]
    DuplicateSequence(u64),

    #[error("hash chain broken at seq {seq}: {reason}")]
    ChainBroken { seq: u64, reason: String },

    #[error("malformed ledger record at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
