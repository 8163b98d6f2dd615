//! Behavioral Classifier
//!
//! Pure function from (subject, observation window) to a threat assessment.
//! Same inputs always give the same assessment.
//!
//! ## Structure
//! - `types`: severity, patterns, assessments
//! - `rules`: confidence buckets and detector thresholds
//! - `profile`: declared subject behavior
//! - `detectors`: the five pattern detectors
//! - `classifier`: window evaluation and streak scoring

pub mod classifier;
pub mod detectors;
pub mod profile;
pub mod rules;
pub mod types;

#[cfg(test)]
mod tests;

pub use classifier::Classifier;
pub use detectors::{standard_detectors, Detector};
pub use profile::{ProfileRule, ProfileSet, SubjectProfile};
pub use rules::{ClassifierConfig, ConfidenceBuckets, DetectorConfig};
pub use types::{
    ClassificationFault, ClassifierBuildError, DetectorMatch, ObservationRange, PatternFinding, PatternId,
    Severity, SubjectContext, ThreatAssessment,
};
