//! Classification Rules & Thresholds
//!
//! Constants and config only. No classify logic here.

use serde::{Deserialize, Serialize};

use super::profile::{ProfileRule, SubjectProfile};
use super::types::Severity;

// ============================================================================
// CONFIDENCE BUCKETS
// ============================================================================

pub const LOW_CONFIDENCE_MIN: f32 = 0.2;
pub const MEDIUM_CONFIDENCE_MIN: f32 = 0.5;
pub const HIGH_CONFIDENCE_MIN: f32 = 0.75;
pub const CRITICAL_CONFIDENCE_MIN: f32 = 0.9;

// ============================================================================
// DETECTOR DEFAULTS
// ============================================================================

/// Clone spawns that count as replication
pub const REPLICATION_SPAWN_THRESHOLD: u32 = 3;

/// Window for counting clone spawns (seconds)
pub const REPLICATION_RATE_WINDOW_SECS: i64 = 60;

/// Single-file write considered bulk (bytes)
pub const LARGE_WRITE_BYTES: u64 = 64 * 1024 * 1024;

/// Log and history files an agent might wipe
pub const CONCEALMENT_PATTERN: &str =
    r"(?i)(\.log(\.\d+)?$|_history$|\.history$|/\.?history/|/logs?/|/journal/|audit)";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceBuckets {
    pub low: f32,
    pub medium: f32,
    pub high: f32,
    pub critical: f32,
}

impl Default for ConfidenceBuckets {
    fn default() -> Self {
        Self {
            low: LOW_CONFIDENCE_MIN,
            medium: MEDIUM_CONFIDENCE_MIN,
            high: HIGH_CONFIDENCE_MIN,
            critical: CRITICAL_CONFIDENCE_MIN,
        }
    }
}

impl ConfidenceBuckets {
    pub fn bucket(&self, confidence: f32) -> Severity {
        if confidence >= self.critical {
            Severity::Critical
        } else if confidence >= self.high {
            Severity::High
        } else if confidence >= self.medium {
            Severity::Medium
        } else if confidence >= self.low {
            Severity::Low
        } else {
            Severity::None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub replication_spawn_threshold: u32,
    pub replication_rate_window_secs: i64,
    pub large_write_bytes: u64,
    pub concealment_pattern: String,
    /// Handle paths never treated as out of scope
    pub ignored_path_prefixes: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            replication_spawn_threshold: REPLICATION_SPAWN_THRESHOLD,
            replication_rate_window_secs: REPLICATION_RATE_WINDOW_SECS,
            large_write_bytes: LARGE_WRITE_BYTES,
            concealment_pattern: CONCEALMENT_PATTERN.to_string(),
            ignored_path_prefixes: vec!["/dev/".to_string(), "/proc/".to_string(), "/sys/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Observations per classification window
    pub window_len: usize,
    /// Absent frames tolerated inside a streak
    pub decay_windows: u32,
    pub buckets: ConfidenceBuckets,
    pub detectors: DetectorConfig,
    pub profiles: Vec<ProfileRule>,
    pub default_profile: SubjectProfile,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window_len: 6,
            decay_windows: 1,
            buckets: ConfidenceBuckets::default(),
            detectors: DetectorConfig::default(),
            profiles: Vec::new(),
            default_profile: SubjectProfile::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_edges() {
        let b = ConfidenceBuckets::default();
        assert_eq!(b.bucket(0.1), Severity::None);
        assert_eq!(b.bucket(0.2), Severity::Low);
        assert_eq!(b.bucket(0.6), Severity::Medium);
        assert_eq!(b.bucket(0.8), Severity::High);
        assert_eq!(b.bucket(0.95), Severity::Critical);
    }
}
