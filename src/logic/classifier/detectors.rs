//! Pattern detectors
//!
//! Each detector is pure: it looks at the latest frame of a window, with
//! the earlier frames as context, and returns at most one match.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use regex::Regex;

use super::rules::DetectorConfig;
use super::types::{ClassifierBuildError, DetectorMatch, PatternId, SubjectContext};
use crate::logic::observer::{ChildSpawn, FileOp, Handle, Observation};

pub trait Detector: Send + Sync {
    fn pattern(&self) -> PatternId;

    fn detect(&self, subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch>;
}

/// The fixed detector set, in evaluation order
pub fn standard_detectors(config: &DetectorConfig) -> Result<Vec<Box<dyn Detector>>, ClassifierBuildError> {
    Ok(vec![
        Box::new(SelfModificationDetector),
        Box::new(ReplicationDetector {
            spawn_threshold: config.replication_spawn_threshold.max(1),
            rate_window: chrono::Duration::seconds(config.replication_rate_window_secs.max(1)),
        }),
        Box::new(PrivilegeEscalationDetector {
            ignored_prefixes: config.ignored_path_prefixes.clone(),
        }),
        Box::new(ConcealmentDetector {
            pattern: Regex::new(&config.concealment_pattern)?,
        }),
        Box::new(ExfiltrationDetector {
            large_write_bytes: config.large_write_bytes,
        }),
    ])
}

// ============================================================================
// SELF-MODIFICATION
// ============================================================================

pub struct SelfModificationDetector;

impl Detector for SelfModificationDetector {
    fn pattern(&self) -> PatternId {
        PatternId::SelfModification
    }

    fn detect(&self, subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch> {
        let current = window.last()?;
        if subject.profile.self_rewrite_expected {
            return None;
        }
        let delta = current.code_hash_delta.as_ref()?;

        let mut evidence = vec![format!(
            "image hash changed {} -> {}",
            short(&delta.previous),
            short(&delta.current)
        )];
        let wrote_image = subject
            .exe_path
            .as_deref()
            .filter(|exe| window.iter().any(|o| wrote_to(o, exe)));

        let confidence = match wrote_image {
            Some(exe) => {
                evidence.push(format!("subject wrote its own image {}", exe.display()));
                0.95
            }
            None => 0.6,
        };

        Some(DetectorMatch {
            pattern: self.pattern(),
            confidence,
            evidence,
        })
    }
}

// ============================================================================
// REPLICATION
// ============================================================================

pub struct ReplicationDetector {
    pub spawn_threshold: u32,
    pub rate_window: chrono::Duration,
}

impl Detector for ReplicationDetector {
    fn pattern(&self) -> PatternId {
        PatternId::Replication
    }

    fn detect(&self, subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch> {
        let current = window.last()?;

        let mut ancestry: HashSet<&str> = subject.lineage_hashes.iter().map(String::as_str).collect();
        ancestry.extend(subject.image_hash.as_deref());
        ancestry.extend(current.image_hash.as_deref());
        if ancestry.is_empty() {
            return None;
        }
        let is_clone = |spawn: &ChildSpawn| {
            spawn
                .image_hash
                .as_deref()
                .map(|h| ancestry.contains(h))
                .unwrap_or(false)
        };

        let clones: Vec<&ChildSpawn> = current.child_spawns.iter().filter(|&s| is_clone(s)).collect();
        if clones.is_empty() {
            return None;
        }

        let cutoff = current.observed_at - self.rate_window;
        let recent = window
            .iter()
            .filter(|o| o.observed_at >= cutoff)
            .map(|o| o.child_spawns.iter().filter(|&s| is_clone(s)).count() as u32)
            .sum::<u32>();
        if recent < self.spawn_threshold {
            return None;
        }

        let current_count = clones.len() as u32;
        let confidence = if current_count >= self.spawn_threshold.saturating_mul(2) {
            0.95
        } else {
            0.8
        };

        let mut evidence = vec![format!(
            "{} clone spawn(s) this sample, {} within {}s",
            current_count,
            recent,
            self.rate_window.num_seconds()
        )];
        evidence.extend(
            clones
                .iter()
                .take(5)
                .map(|s| format!("clone {} ({})", s.child, s.name)),
        );

        Some(DetectorMatch {
            pattern: self.pattern(),
            confidence,
            evidence,
        })
    }
}

// ============================================================================
// PRIVILEGE ESCALATION
// ============================================================================

pub struct PrivilegeEscalationDetector {
    pub ignored_prefixes: Vec<String>,
}

impl PrivilegeEscalationDetector {
    fn ignored(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.ignored_prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }
}

impl Detector for PrivilegeEscalationDetector {
    fn pattern(&self) -> PatternId {
        PatternId::PrivilegeEscalation
    }

    fn detect(&self, subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch> {
        let (current, earlier) = window.split_last()?;
        let mut confidence: f32 = 0.0;
        let mut evidence = Vec::new();

        let previous_uid = earlier
            .iter()
            .rev()
            .filter(|o| !o.is_unreachable())
            .find_map(|o| o.resources.effective_uid);
        if let (Some(previous), Some(0)) = (previous_uid, current.resources.effective_uid) {
            if previous != 0 {
                confidence = 0.95;
                evidence.push(format!("effective uid changed {} -> 0", previous));
            }
        }

        let outside: BTreeSet<&Path> = current
            .handles
            .iter()
            .filter_map(|h| match h {
                Handle::File { path, .. } => Some(path.as_path()),
                _ => None,
            })
            .filter(|p| !self.ignored(p) && !subject.profile.path_allowed(p))
            .collect();
        if !outside.is_empty() {
            let scope = (0.5 + 0.1 * (outside.len() as f32 - 1.0)).min(0.85);
            confidence = confidence.max(scope);
            let listed: Vec<String> = outside.iter().take(3).map(|p| p.display().to_string()).collect();
            evidence.push(format!(
                "{} handle(s) outside declared scope: {}",
                outside.len(),
                listed.join(", ")
            ));
        }

        (confidence > 0.0).then(|| DetectorMatch {
            pattern: self.pattern(),
            confidence,
            evidence,
        })
    }
}

// ============================================================================
// CONCEALMENT
// ============================================================================

pub struct ConcealmentDetector {
    pub pattern: Regex,
}

impl Detector for ConcealmentDetector {
    fn pattern(&self) -> PatternId {
        PatternId::Concealment
    }

    fn detect(&self, _subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch> {
        let current = window.last()?;
        let mut confidence: f32 = 0.0;
        let mut evidence = Vec::new();

        for activity in &current.file_activity {
            if !matches!(activity.op, FileOp::Delete | FileOp::Rename | FileOp::Truncate) {
                continue;
            }
            if !self.pattern.is_match(&activity.path.to_string_lossy()) {
                continue;
            }
            let own_write = window.iter().any(|o| wrote_to(o, &activity.path));
            let score = match (activity.op, own_write) {
                (FileOp::Delete, true) => 0.85,
                (_, true) => 0.7,
                _ => 0.35,
            };
            confidence = confidence.max(score);
            evidence.push(format!(
                "{:?} of {}{}",
                activity.op,
                activity.path.display(),
                if own_write { " after writing to it" } else { "" }
            ));
        }

        (confidence > 0.0).then(|| DetectorMatch {
            pattern: self.pattern(),
            confidence,
            evidence,
        })
    }
}

// ============================================================================
// EXFILTRATION
// ============================================================================

pub struct ExfiltrationDetector {
    pub large_write_bytes: u64,
}

impl Detector for ExfiltrationDetector {
    fn pattern(&self) -> PatternId {
        PatternId::Exfiltration
    }

    fn detect(&self, subject: &SubjectContext, window: &[Observation]) -> Option<DetectorMatch> {
        let (current, earlier) = window.split_last()?;
        let profile = &subject.profile;
        let mut confidence: f32 = 0.0;
        let mut evidence = Vec::new();

        let remotes: BTreeSet<&str> = current
            .handles
            .iter()
            .filter_map(|h| match h {
                Handle::Socket {
                    remote: Some(remote),
                    outbound: true,
                } => Some(remote.as_str()),
                _ => None,
            })
            .filter(|r| !profile.remote_allowed(r))
            .collect();
        if !remotes.is_empty() {
            confidence = (0.55 + 0.1 * (remotes.len() as f32 - 1.0)).min(0.85);
            let listed: Vec<&str> = remotes.iter().take(3).copied().collect();
            evidence.push(format!("outbound to undeclared remote(s): {}", listed.join(", ")));
        }

        for activity in &current.file_activity {
            if activity.op == FileOp::Write
                && activity.bytes >= self.large_write_bytes
                && !profile.path_allowed(&activity.path)
            {
                confidence = confidence.max(0.6);
                evidence.push(format!(
                    "bulk write of {} bytes to {}",
                    activity.bytes,
                    activity.path.display()
                ));
            }
        }

        if let Some(budget) = profile.write_budget_bytes {
            let previous = earlier
                .iter()
                .rev()
                .find(|o| !o.is_unreachable())
                .map(|o| o.resources.disk_written_bytes);
            if let Some(previous) = previous {
                let written = current.resources.disk_written_bytes.saturating_sub(previous);
                if written > budget {
                    let score = if written > budget.saturating_mul(4) { 0.8 } else { 0.6 };
                    confidence = confidence.max(score);
                    evidence.push(format!("wrote {} bytes against a budget of {}", written, budget));
                }
            }
        }

        (confidence > 0.0).then(|| DetectorMatch {
            pattern: self.pattern(),
            confidence,
            evidence,
        })
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn wrote_to(observation: &Observation, path: &Path) -> bool {
    observation
        .file_activity
        .iter()
        .any(|a| a.op == FileOp::Write && a.path == path)
        || observation.handles.iter().any(|h| {
            matches!(h, Handle::File { path: p, writable: true } if p.as_path() == path)
        })
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
