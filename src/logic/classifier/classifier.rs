//! Behavioral classification
//!
//! Detectors run on every prefix of the window so a pattern's streak is
//! known. Only patterns present in the latest frame are reported.
//!
//! Severity per finding:
//! - streak of 1 (isolated): one step below the confidence bucket
//! - streak of 2: the confidence bucket
//! - streak of 3 or more: one step above, capped at critical

use super::detectors::{standard_detectors, Detector};
use super::rules::{ClassifierConfig, ConfidenceBuckets};
use super::types::{
    ClassificationFault, ClassifierBuildError, DetectorMatch, ObservationRange, PatternFinding, PatternId,
    Severity, SubjectContext, ThreatAssessment,
};
use crate::logic::observer::Observation;

pub struct Classifier {
    detectors: Vec<Box<dyn Detector>>,
    buckets: ConfidenceBuckets,
    decay_windows: u32,
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifierBuildError> {
        Ok(Self::with_detectors(
            standard_detectors(&config.detectors)?,
            config.buckets,
            config.decay_windows,
        ))
    }

    pub fn with_detectors(detectors: Vec<Box<dyn Detector>>, buckets: ConfidenceBuckets, decay_windows: u32) -> Self {
        Self {
            detectors,
            buckets,
            decay_windows,
        }
    }

    /// Classify a window of one subject's observations, oldest first
    pub fn classify(
        &self,
        subject: &SubjectContext,
        window: &[Observation],
    ) -> Result<ThreatAssessment, ClassificationFault> {
        validate(subject, window)?;
        let (first, latest) = match (window.first(), window.last()) {
            (Some(first), Some(latest)) => (first, latest),
            _ => return Err(ClassificationFault::EmptyWindow),
        };

        let frames: Vec<Frame> = (0..window.len())
            .map(|end| {
                let prefix = &window[..=end];
                if prefix[end].is_unreachable() {
                    Frame::Unreachable
                } else {
                    Frame::Matched(
                        self.detectors
                            .iter()
                            .filter_map(|d| d.detect(subject, prefix))
                            .collect(),
                    )
                }
            })
            .collect();

        let mut findings = Vec::new();
        if let Some(Frame::Matched(latest_matches)) = frames.last() {
            for m in latest_matches {
                let streak = self.streak(&frames, m.pattern);
                let bucket = self.buckets.bucket(m.confidence);
                // Only an isolated low-confidence match is suppressed
                let severity = match streak {
                    0 | 1 if bucket <= Severity::Low => bucket.lowered(),
                    0..=2 => bucket,
                    _ => bucket.raised(),
                };
                findings.push(PatternFinding {
                    pattern: m.pattern,
                    confidence: m.confidence,
                    bucket,
                    streak,
                    severity,
                    evidence: m.evidence.clone(),
                });
            }
        }
        findings.sort_by_key(|f| f.pattern);

        let severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::None);

        Ok(ThreatAssessment {
            subject: subject.id,
            observations: ObservationRange {
                first: first.seq,
                last: latest.seq,
            },
            matched: findings.iter().map(|f| f.pattern).collect(),
            findings,
            severity,
            degraded: latest.is_unreachable(),
            assessed_at: latest.observed_at,
        })
    }

    /// Frames the pattern held, counting back from the latest.
    /// Unreachable frames neither extend nor break a streak.
    fn streak(&self, frames: &[Frame], pattern: PatternId) -> u32 {
        let mut streak = 0;
        let mut gap = 0;
        for frame in frames.iter().rev() {
            match frame {
                Frame::Unreachable => continue,
                Frame::Matched(matches) if matches.iter().any(|m| m.pattern == pattern) => {
                    streak += 1;
                    gap = 0;
                }
                Frame::Matched(_) => {
                    gap += 1;
                    if gap > self.decay_windows {
                        break;
                    }
                }
            }
        }
        streak
    }
}

enum Frame {
    Unreachable,
    Matched(Vec<DetectorMatch>),
}

fn validate(subject: &SubjectContext, window: &[Observation]) -> Result<(), ClassificationFault> {
    if window.is_empty() {
        return Err(ClassificationFault::EmptyWindow);
    }
    if let Some(foreign) = window.iter().find(|o| o.subject != subject.id) {
        return Err(ClassificationFault::ForeignObservation {
            expected: subject.id,
            found: foreign.subject,
        });
    }
    for pair in window.windows(2) {
        if pair[1].seq <= pair[0].seq || pair[1].observed_at < pair[0].observed_at {
            return Err(ClassificationFault::OutOfOrder {
                previous: pair[0].seq,
                next: pair[1].seq,
            });
        }
    }
    Ok(())
}
