//! Observer Types

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// IDENTITY
// ============================================================================

/// A process identity that survives pid reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId {
    pub pid: u32,
    /// Process start time (seconds since epoch)
    pub start_time: u64,
}

impl SubjectId {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// What enumeration reports about a live process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub id: SubjectId,
    pub name: String,
    pub exe_path: Option<PathBuf>,
    pub parent: Option<SubjectId>,
}

// ============================================================================
// OBSERVATION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    /// Cumulative bytes written to disk
    pub disk_written_bytes: u64,
    pub effective_uid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handle {
    File { path: PathBuf, writable: bool },
    Socket { remote: Option<String>, outbound: bool },
    Other { target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Write,
    Delete,
    Rename,
    Truncate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileActivity {
    pub path: PathBuf,
    pub op: FileOp,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpawn {
    pub child: SubjectId,
    pub name: String,
    pub image_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDelta {
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ObservationStatus {
    Ok,
    Unreachable { reason: String },
}

/// One sample of one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub subject: SubjectId,
    /// Per-subject, strictly increasing
    pub seq: u64,
    pub observed_at: DateTime<Utc>,
    pub status: ObservationStatus,
    pub resources: ResourceUsage,
    pub handles: Vec<Handle>,
    pub file_activity: Vec<FileActivity>,
    pub child_spawns: Vec<ChildSpawn>,
    pub image_hash: Option<String>,
    pub code_hash_delta: Option<HashDelta>,
}

impl Observation {
    pub fn unreachable(subject: SubjectId, seq: u64, observed_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            subject,
            seq,
            observed_at,
            status: ObservationStatus::Unreachable { reason: reason.into() },
            resources: ResourceUsage::default(),
            handles: Vec::new(),
            file_activity: Vec::new(),
            child_spawns: Vec::new(),
            image_hash: None,
            code_hash_delta: None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self.status, ObservationStatus::Unreachable { .. })
    }
}

/// Raw probe result before sequencing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessProbe {
    pub resources: ResourceUsage,
    pub handles: Vec<Handle>,
    pub file_activity: Vec<FileActivity>,
    pub child_spawns: Vec<ChildSpawn>,
    pub image_hash: Option<String>,
}

// ============================================================================
// CYCLE OUTPUT
// ============================================================================

/// A subject seen for the first time, with its lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub descriptor: ProcessDescriptor,
    /// Ancestors, nearest first
    pub lineage: Vec<SubjectId>,
    pub lineage_hashes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SampleReport {
    pub discovered: Vec<Discovery>,
    /// Already recorded in the ledger, sorted by subject
    pub observations: Vec<Observation>,
    pub exited: Vec<SubjectId>,
    pub liveness_fault: Option<String>,
    /// Observations that could not be recorded and were dropped
    pub dropped: usize,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub enumerate_timeout_ms: u64,
    pub enumerate_retries: u32,
    pub backoff_base_ms: u64,
    pub max_workers: usize,
    /// Regexes matched against process name or image path.
    /// Empty watches every process.
    pub watch_patterns: Vec<String>,
    pub exclude_self: bool,
    /// Ancestors recorded per subject
    pub lineage_depth: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::constants::DEFAULT_POLL_INTERVAL_MS,
            probe_timeout_ms: 750,
            enumerate_timeout_ms: 2_000,
            enumerate_retries: 3,
            backoff_base_ms: 200,
            max_workers: 8,
            watch_patterns: vec![
                r"(?i)agent".to_string(),
                r"(?i)autogpt".to_string(),
                r"(?i)llm".to_string(),
                r"(?i)assistant".to_string(),
            ],
            exclude_self: true,
            lineage_depth: 8,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("process {0} not found")]
    NotFound(SubjectId),

    #[error("host query failed: {0}")]
    Unavailable(String),
}
