//! Engine Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logic::classifier::{ClassifierBuildError, ThreatAssessment};
use crate::logic::lifecycle::{SubjectRecord, SubjectState};
use crate::logic::observer::ObserverError;
use crate::logic::response::{ActionRecord, ContainmentError};

/// What the operator report shows for one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub record: SubjectRecord,
    pub state: SubjectState,
    pub last_assessment: Option<ThreatAssessment>,
    pub pending_nonce: Option<u64>,
    pub last_action: Option<ActionRecord>,
    pub held_escalations: u32,
    pub observations: u64,
    pub updated_at: DateTime<Utc>,
}

/// Result of one sampling cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub discovered: usize,
    pub observed: usize,
    pub exited: usize,
    /// Observations the ledger refused
    pub dropped: usize,
    pub liveness_fault: Option<String>,
    /// Subjects that had not finished processing at the cycle deadline
    pub unacknowledged: usize,
    pub tracked: usize,
    pub ledger_durable: bool,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Observer(#[from] ObserverError),

    #[error(transparent)]
    Classifier(#[from] ClassifierBuildError),

    #[error("invalid profile pattern: {0}")]
    Profile(#[from] regex::Error),

    #[error(transparent)]
    Containment(#[from] ContainmentError),
}
