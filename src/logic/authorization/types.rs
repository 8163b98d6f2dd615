//! Authorization Types

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::logic::classifier::ThreatAssessment;
use crate::logic::ledger::LedgerError;
use crate::logic::lifecycle::SubjectRecord;
use crate::logic::observer::SubjectId;

/// Domain tag of the signed message
pub const SIGNING_DOMAIN: &str = "ai-guardian/authorization/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainmentAction {
    Terminate,
    Quarantine,
}

impl ContainmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainmentAction::Terminate => "terminate",
            ContainmentAction::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for ContainmentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// REQUEST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub request_id: Uuid,
    pub nonce: u64,
    pub subject: SubjectId,
    pub subject_name: String,
    pub image_path: Option<PathBuf>,
    pub action: ContainmentAction,
    pub justification: ThreatAssessment,
    /// Ledger seq of the assessment that triggered the request
    pub assessment_seq: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn new(
        nonce: u64,
        subject: &SubjectRecord,
        action: ContainmentAction,
        justification: ThreatAssessment,
        assessment_seq: Option<u64>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            nonce,
            subject: subject.id,
            subject_name: subject.name.clone(),
            image_path: subject.exe_path.clone(),
            action,
            justification,
            assessment_seq,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// Bytes the operator signs for `verdict`
    pub fn signing_message(&self, verdict: Verdict) -> Vec<u8> {
        format!(
            "{}\nnonce={}\nrequest={}\nsubject={}\naction={}\nverdict={}",
            SIGNING_DOMAIN,
            self.nonce,
            self.request_id,
            self.subject,
            self.action,
            verdict.as_str()
        )
        .into_bytes()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// RESPONSE
// ============================================================================

/// What the operator signed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Deny,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Deny => "deny",
        }
    }
}

/// Signed payload from the human channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDecision {
    pub nonce: u64,
    pub decision: Verdict,
    pub operator_id: String,
    /// Hex-encoded ed25519 signature over the request's signing message
    pub signature: String,
}

// ============================================================================
// DECISION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
    Expired,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Denied => "denied",
            Decision::Expired => "expired",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Operator,
    InvalidSignature,
    UnknownOperator,
    MalformedResponse,
    ChannelUnavailable,
    LedgerUnavailable,
    /// The subject's process exited before anyone answered
    SubjectExited,
}

/// Ledger record of a resolved request, raw signature included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub request_id: Uuid,
    pub nonce: u64,
    pub subject: SubjectId,
    pub action: ContainmentAction,
    pub decision: Decision,
    pub reason: Option<DenialReason>,
    pub operator_id: Option<String>,
    pub signature: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub request_ttl_secs: i64,
    /// `None` resolves to the data dir default
    pub operator_keys_path: Option<PathBuf>,
    /// File-drop channel folder; `None` resolves to the data dir default
    pub channel_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            request_ttl_secs: 900,
            operator_keys_path: None,
            channel_dir: None,
            poll_interval_ms: 1_000,
        }
    }
}

impl AuthorizationConfig {
    pub fn request_ttl(&self) -> Duration {
        Duration::seconds(self.request_ttl_secs.max(1))
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request {0} was already submitted")]
    AlreadySubmitted(u64),

    #[error("request {0} was not issued by this gateway")]
    NotIssued(u64),

    #[error("request {0} expired before submission")]
    AlreadyExpired(u64),

    #[error("cannot record request in ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("no outstanding request for nonce {0}")]
    UnknownNonce(u64),

    #[error("nonce {0} was already resolved")]
    Replayed(u64),

    #[error("resolution for nonce {0} was lost")]
    Abandoned(u64),
}
