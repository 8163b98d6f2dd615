//! Per-subject threat state machine
//!
//! Driven only by the subject's own queue, so calls arrive in
//! observation order. One assessment moves the state at most one step.

use super::types::{LifecycleConfig, SubjectState, Transition, TransitionCause};
use crate::logic::authorization::{ContainmentAction, Decision};
use crate::logic::classifier::{Severity, ThreatAssessment};
use crate::logic::observer::SubjectId;
use crate::logic::response::ActionRecord;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub transitions: Vec<Transition>,
    /// The subject just entered PendingAuthorization; a request must be issued
    pub escalate: bool,
}

#[derive(Debug, Clone)]
pub struct ThreatStateMachine {
    subject: SubjectId,
    state: SubjectState,
    config: LifecycleConfig,
    elevated_windows: u32,
    quiet_windows: u32,
    pending_nonce: Option<u64>,
    approved_nonce: Option<u64>,
    held_escalations: u32,
}

impl ThreatStateMachine {
    pub fn new(subject: SubjectId, config: LifecycleConfig) -> Self {
        Self {
            subject,
            state: SubjectState::Observed,
            config,
            elevated_windows: 0,
            quiet_windows: 0,
            pending_nonce: None,
            approved_nonce: None,
            held_escalations: 0,
        }
    }

    pub fn state(&self) -> SubjectState {
        self.state
    }

    pub fn pending_nonce(&self) -> Option<u64> {
        self.pending_nonce
    }

    /// Escalations withheld because the ledger was not durable
    pub fn held_escalations(&self) -> u32 {
        self.held_escalations
    }

    pub fn on_assessment(
        &mut self,
        assessment: &ThreatAssessment,
        assessment_seq: Option<u64>,
        escalation_allowed: bool,
    ) -> StepOutcome {
        let mut outcome = StepOutcome::default();
        if self.state.is_terminal() || assessment.degraded {
            return outcome;
        }

        let severity = assessment.severity;
        if severity == Severity::None {
            self.quiet_windows += 1;
            self.elevated_windows = 0;
        } else {
            self.quiet_windows = 0;
            self.elevated_windows += 1;
        }
        let cause = TransitionCause::Assessment {
            assessment_seq,
            severity,
        };

        match self.state {
            SubjectState::Cleared => {
                if severity >= Severity::Low {
                    self.move_to(
                        SubjectState::Observed,
                        TransitionCause::Resumed {
                            observation_seq: assessment.observations.last,
                        },
                        &mut outcome,
                    );
                }
            }
            SubjectState::Observed => {
                if severity >= Severity::Low {
                    self.move_to(SubjectState::Suspicious, cause, &mut outcome);
                }
            }
            SubjectState::Suspicious => {
                if severity >= Severity::Medium {
                    self.move_to(SubjectState::Flagged, cause, &mut outcome);
                } else if severity >= Severity::Low && self.elevated_windows >= self.config.sustain_windows {
                    let windows = self.elevated_windows;
                    self.move_to(
                        SubjectState::Flagged,
                        TransitionCause::Sustained {
                            assessment_seq,
                            windows,
                        },
                        &mut outcome,
                    );
                } else if !self.maybe_clear(&mut outcome) && self.quiet_windows >= self.config.decay_windows {
                    let windows = self.quiet_windows;
                    self.reset_counters();
                    self.move_to(SubjectState::Observed, TransitionCause::Quiescent { windows }, &mut outcome);
                }
            }
            SubjectState::Flagged => {
                if severity >= Severity::High {
                    if escalation_allowed {
                        self.move_to(SubjectState::PendingAuthorization, cause, &mut outcome);
                        outcome.escalate = true;
                    } else {
                        self.held_escalations += 1;
                        log::warn!(
                            "Subject {} at {} severity held in flagged: ledger is not durable",
                            self.subject,
                            severity
                        );
                    }
                } else {
                    self.maybe_clear(&mut outcome);
                }
            }
            SubjectState::PendingAuthorization
            | SubjectState::ContainmentPending
            | SubjectState::Quarantined
            | SubjectState::Terminated
            | SubjectState::ExitedNaturally => {}
        }
        outcome
    }

    /// Attach the nonce of the request issued for the current escalation
    pub fn bind_request(&mut self, nonce: u64) {
        if self.state == SubjectState::PendingAuthorization {
            self.pending_nonce = Some(nonce);
        }
    }

    pub fn on_resolution(&mut self, nonce: u64, decision: Decision) -> Option<Transition> {
        if self.state != SubjectState::PendingAuthorization || self.pending_nonce != Some(nonce) {
            return None;
        }
        self.pending_nonce = None;
        let cause = TransitionCause::Authorization { nonce, decision };
        let to = match decision {
            Decision::Approved => {
                self.approved_nonce = Some(nonce);
                SubjectState::ContainmentPending
            }
            Decision::Denied | Decision::Expired => {
                self.reset_counters();
                SubjectState::Flagged
            }
        };
        Some(self.transition(to, cause))
    }

    /// The request could not be submitted at all
    pub fn on_submission_failed(&mut self, nonce: u64, reason: &str) -> Option<Transition> {
        if self.state != SubjectState::PendingAuthorization || self.pending_nonce != Some(nonce) {
            return None;
        }
        self.pending_nonce = None;
        self.reset_counters();
        Some(self.transition(
            SubjectState::Flagged,
            TransitionCause::SubmissionFailed {
                nonce,
                reason: reason.to_string(),
            },
        ))
    }

    /// A failed action leaves the subject in ContainmentPending
    pub fn on_action(&mut self, record: &ActionRecord) -> Option<Transition> {
        if self.state != SubjectState::ContainmentPending
            || self.approved_nonce != Some(record.nonce)
            || !record.succeeded()
        {
            return None;
        }
        let to = match record.action {
            ContainmentAction::Quarantine => SubjectState::Quarantined,
            ContainmentAction::Terminate => SubjectState::Terminated,
        };
        Some(self.transition(
            to,
            TransitionCause::Containment {
                nonce: record.nonce,
                action_id: record.action_id,
            },
        ))
    }

    /// An exit after an approved action ends in Terminated, linked to that approval
    pub fn on_exit(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        self.pending_nonce = None;
        match (self.state, self.approved_nonce) {
            (SubjectState::ContainmentPending | SubjectState::Quarantined, Some(nonce)) => Some(self.transition(
                SubjectState::Terminated,
                TransitionCause::ContainedExit { nonce },
            )),
            _ => Some(self.transition(SubjectState::ExitedNaturally, TransitionCause::ProcessExit)),
        }
    }

    fn maybe_clear(&mut self, outcome: &mut StepOutcome) -> bool {
        if self.quiet_windows < self.config.clear_windows {
            return false;
        }
        let windows = self.quiet_windows;
        self.reset_counters();
        self.move_to(SubjectState::Cleared, TransitionCause::Quiescent { windows }, outcome);
        true
    }

    fn reset_counters(&mut self) {
        self.quiet_windows = 0;
        self.elevated_windows = 0;
    }

    fn move_to(&mut self, to: SubjectState, cause: TransitionCause, outcome: &mut StepOutcome) {
        let transition = self.transition(to, cause);
        outcome.transitions.push(transition);
    }

    fn transition(&mut self, to: SubjectState, cause: TransitionCause) -> Transition {
        let from = self.state;
        self.state = to;
        log::info!("Subject {} {} -> {}", self.subject, from, to);
        Transition {
            subject: self.subject,
            from,
            to,
            cause,
        }
    }
}
