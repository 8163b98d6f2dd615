//! Lifecycle Types

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logic::authorization::Decision;
use crate::logic::classifier::Severity;
use crate::logic::observer::{Discovery, SubjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    Observed,
    Suspicious,
    Flagged,
    PendingAuthorization,
    ContainmentPending,
    Quarantined,
    Terminated,
    Cleared,
    ExitedNaturally,
}

impl SubjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectState::Observed => "observed",
            SubjectState::Suspicious => "suspicious",
            SubjectState::Flagged => "flagged",
            SubjectState::PendingAuthorization => "pending_authorization",
            SubjectState::ContainmentPending => "containment_pending",
            SubjectState::Quarantined => "quarantined",
            SubjectState::Terminated => "terminated",
            SubjectState::Cleared => "cleared",
            SubjectState::ExitedNaturally => "exited_naturally",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubjectState::Terminated | SubjectState::ExitedNaturally)
    }

    /// States that may not be cleared by quiet assessments
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            SubjectState::PendingAuthorization | SubjectState::ContainmentPending | SubjectState::Quarantined
        )
    }
}

impl fmt::Display for SubjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched process as the agent knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: SubjectId,
    pub name: String,
    pub exe_path: Option<PathBuf>,
    pub image_hash: Option<String>,
    /// Ancestors, nearest first
    pub lineage: Vec<SubjectId>,
    pub lineage_hashes: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub state: SubjectState,
}

impl SubjectRecord {
    pub fn from_discovery(discovery: &Discovery, first_seen: DateTime<Utc>) -> Self {
        Self {
            id: discovery.descriptor.id,
            name: discovery.descriptor.name.clone(),
            exe_path: discovery.descriptor.exe_path.clone(),
            image_hash: None,
            lineage: discovery.lineage.clone(),
            lineage_hashes: discovery.lineage_hashes.clone(),
            first_seen,
            state: SubjectState::Observed,
        }
    }
}

/// Why a transition happened; every transition carries one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionCause {
    Assessment {
        assessment_seq: Option<u64>,
        severity: Severity,
    },
    Sustained {
        assessment_seq: Option<u64>,
        windows: u32,
    },
    Quiescent {
        windows: u32,
    },
    Resumed {
        observation_seq: u64,
    },
    Authorization {
        nonce: u64,
        decision: Decision,
    },
    SubmissionFailed {
        nonce: u64,
        reason: String,
    },
    Containment {
        nonce: u64,
        action_id: Uuid,
    },
    ProcessExit,
    /// The process exited while an approved action was pending or in effect
    ContainedExit {
        nonce: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub subject: SubjectId,
    pub from: SubjectState,
    pub to: SubjectState,
    pub cause: TransitionCause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Windows at low or above before Suspicious becomes Flagged
    pub sustain_windows: u32,
    /// Consecutive none windows before Suspicious decays back to Observed
    pub decay_windows: u32,
    /// Consecutive none windows before Suspicious or Flagged clears
    pub clear_windows: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            sustain_windows: 4,
            decay_windows: 2,
            clear_windows: 5,
        }
    }
}
