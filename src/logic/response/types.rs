//! Response Types

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::logic::authorization::ContainmentAction;
use crate::logic::classifier::Severity;
use crate::logic::observer::SubjectId;

// ============================================================================
// ACTION RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
        }
    }
}

/// How a terminate action stopped the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    Graceful,
    Forced,
    AlreadyExited,
}

/// Where a quarantined image went, and how to bring it back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: String,
    pub subject: SubjectId,
    pub nonce: u64,
    pub original_path: PathBuf,
    pub quarantine_path: PathBuf,
    pub file_size: u64,
    pub sha256: String,
    /// Unix permission bits before quarantine
    pub original_mode: Option<u32>,
    pub quarantined_at: DateTime<Utc>,
    pub can_restore: bool,
}

/// Outcome of one containment action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub request_id: Uuid,
    pub nonce: u64,
    pub subject: SubjectId,
    pub action: ContainmentAction,
    pub operator_id: String,
    /// Ledger seq of the approval this action executed under
    pub approval_seq: u64,
    pub status: ActionStatus,
    pub stop_method: Option<StopMethod>,
    /// Rollback data for quarantine
    pub quarantine: Option<QuarantineEntry>,
    pub steps: Vec<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ActionRecord {
    pub fn succeeded(&self) -> bool {
        self.status == ActionStatus::Succeeded
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentConfig {
    /// Wait after SIGTERM before SIGKILL
    pub grace_period_ms: u64,
    /// Wait after SIGKILL before declaring failure
    pub kill_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// `None` resolves to the data dir default
    pub quarantine_dir: Option<PathBuf>,
    pub default_action: ContainmentAction,
    /// Terminate instead of quarantine when severity is critical
    pub terminate_on_critical: bool,
    pub quarantine_min_severity: Severity,
    pub terminate_min_severity: Severity,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            kill_wait_ms: 2_000,
            poll_interval_ms: 100,
            quarantine_dir: None,
            default_action: ContainmentAction::Quarantine,
            terminate_on_critical: false,
            quarantine_min_severity: Severity::High,
            terminate_min_severity: Severity::High,
        }
    }
}

impl ContainmentConfig {
    pub fn min_severity(&self, action: ContainmentAction) -> Severity {
        match action {
            ContainmentAction::Quarantine => self.quarantine_min_severity,
            ContainmentAction::Terminate => self.terminate_min_severity,
        }
    }

    /// Action to request for an escalation at `severity`
    pub fn action_for(&self, severity: Severity) -> ContainmentAction {
        if self.terminate_on_critical && severity == Severity::Critical {
            ContainmentAction::Terminate
        } else {
            self.default_action
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ContainmentError {
    #[error("assessment severity {actual} is below the {required} required for {action}")]
    BelowThreshold {
        action: ContainmentAction,
        required: Severity,
        actual: Severity,
    },

    #[error("ledger cannot durably record the action: {0}")]
    LedgerUnavailable(String),

    #[error("process {0} is still running after forced stop")]
    StillRunning(SubjectId),

    #[error("signal failed: {0}")]
    Signal(String),

    #[error("subject {0} has no known image to quarantine")]
    NoImage(SubjectId),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("quarantine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("record {0} has nothing to restore")]
    NotRestorable(Uuid),

    #[error("authorization {0} was already executed")]
    AlreadyExecuted(u64),
}
