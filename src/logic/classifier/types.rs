//! Classifier Types
//!
//! Core types for behavioral classification.
//! No logic here, only data structures.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::profile::SubjectProfile;
use crate::logic::observer::SubjectId;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Severity::None,
            1 => Severity::Low,
            2 => Severity::Medium,
            3 => Severity::High,
            _ => Severity::Critical,
        }
    }

    /// One step up, capped at critical
    pub fn raised(self) -> Self {
        Self::from_level(self.level().saturating_add(1))
    }

    /// One step down, floored at none
    pub fn lowered(self) -> Self {
        Self::from_level(self.level().saturating_sub(1))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PATTERNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternId {
    SelfModification,
    Replication,
    PrivilegeEscalation,
    Concealment,
    Exfiltration,
}

impl PatternId {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternId::SelfModification => "self_modification",
            PatternId::Replication => "replication",
            PatternId::PrivilegeEscalation => "privilege_escalation",
            PatternId::Concealment => "concealment",
            PatternId::Exfiltration => "exfiltration",
        }
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw detector output for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorMatch {
    pub pattern: PatternId,
    pub confidence: f32,
    pub evidence: Vec<String>,
}

/// A detector match after bucketing and streak adjustment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternFinding {
    pub pattern: PatternId,
    pub confidence: f32,
    /// Severity implied by confidence alone
    pub bucket: Severity,
    /// Consecutive frames the pattern held
    pub streak: u32,
    pub severity: Severity,
    pub evidence: Vec<String>,
}

// ============================================================================
// ASSESSMENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationRange {
    pub first: u64,
    pub last: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub subject: SubjectId,
    pub observations: ObservationRange,
    /// Patterns matched in the latest frame
    pub matched: Vec<PatternId>,
    pub findings: Vec<PatternFinding>,
    pub severity: Severity,
    /// Latest frame was unreachable; state must not move on this
    pub degraded: bool,
    /// Timestamp of the latest frame
    pub assessed_at: DateTime<Utc>,
}

impl ThreatAssessment {
    pub fn summary(&self) -> String {
        if self.matched.is_empty() {
            return format!("{} severity, no patterns", self.severity);
        }
        let patterns: Vec<&str> = self.matched.iter().map(|p| p.as_str()).collect();
        format!("{} severity: {}", self.severity, patterns.join(", "))
    }
}

/// Everything a detector may know about the subject
#[derive(Debug, Clone)]
pub struct SubjectContext {
    pub id: SubjectId,
    pub name: String,
    pub exe_path: Option<PathBuf>,
    pub image_hash: Option<String>,
    pub lineage_hashes: Vec<String>,
    pub profile: SubjectProfile,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassificationFault {
    #[error("observation window is empty")]
    EmptyWindow,

    #[error("window for {expected} contains observation of {found}")]
    ForeignObservation { expected: SubjectId, found: SubjectId },

    #[error("observation seq {next} does not follow {previous}")]
    OutOfOrder { previous: u64, next: u64 },
}

impl ClassificationFault {
    /// Seq of the observation that made the window malformed
    pub fn offending_seq(&self, window_last: u64) -> u64 {
        match self {
            ClassificationFault::OutOfOrder { next, .. } => *next,
            _ => window_last,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifierBuildError {
    #[error("invalid pattern in classifier config: {0}")]
    Pattern(#[from] regex::Error),
}
