//! Threat State Machine - Lifecycle of each watched subject
//!
//! Observed -> Suspicious -> Flagged -> PendingAuthorization ->
//! ContainmentPending -> Quarantined | Terminated, with Cleared and
//! ExitedNaturally as side exits. Containment is only reachable through
//! an approved authorization.

pub mod machine;
pub mod types;


pub use machine::{StepOutcome, ThreatStateMachine};
pub use types::{LifecycleConfig, SubjectRecord, SubjectState, Transition, TransitionCause};
