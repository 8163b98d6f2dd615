//! Per-subject tracker
//!
//! Owns one subject's observation window and state machine. Only the
//! subject's own queue calls into it, so everything here runs in
//! observation order for that subject.

use std::collections::VecDeque;

use chrono::Utc;

use super::guardian::Services;
use super::types::SubjectSnapshot;
use crate::logic::alerts::{Alert, AlertKind, AlertLevel};
use crate::logic::authorization::{AuthorizationGrant, AuthorizationRequest, Decision, Resolution};
use crate::logic::classifier::{SubjectContext, SubjectProfile, ThreatAssessment};
use crate::logic::ledger::AuditEvent;
use crate::logic::lifecycle::{LifecycleConfig, SubjectRecord, SubjectState, ThreatStateMachine, Transition};
use crate::logic::observer::{Observation, SubjectId};
use crate::logic::response::{ActionRecord, ContainmentError};

pub struct SubjectTracker {
    record: SubjectRecord,
    profile: SubjectProfile,
    window: VecDeque<Observation>,
    machine: ThreatStateMachine,
    last_assessment: Option<ThreatAssessment>,
    last_action: Option<ActionRecord>,
    observations: u64,
}

impl SubjectTracker {
    pub fn new(record: SubjectRecord, profile: SubjectProfile, config: LifecycleConfig) -> Self {
        let machine = ThreatStateMachine::new(record.id, config);
        Self {
            record,
            profile,
            window: VecDeque::new(),
            machine,
            last_assessment: None,
            last_action: None,
            observations: 0,
        }
    }

    pub fn id(&self) -> SubjectId {
        self.record.id
    }

    pub fn state(&self) -> SubjectState {
        self.machine.state()
    }

    pub fn snapshot(&self) -> SubjectSnapshot {
        SubjectSnapshot {
            record: self.record.clone(),
            state: self.machine.state(),
            last_assessment: self.last_assessment.clone(),
            pending_nonce: self.machine.pending_nonce(),
            last_action: self.last_action.clone(),
            held_escalations: self.machine.held_escalations(),
            observations: self.observations,
            updated_at: Utc::now(),
        }
    }

    /// Classify the new window and step the state machine. Returns the
    /// request to submit when the subject escalates.
    pub fn on_observation(&mut self, observation: Observation, svc: &Services) -> Option<AuthorizationRequest> {
        if self.state().is_terminal() {
            return None;
        }
        self.observations += 1;
        if let Some(hash) = &observation.image_hash {
            self.record.image_hash = Some(hash.clone());
        }
        let latest_seq = observation.seq;
        self.window.push_back(observation);
        while self.window.len() > svc.window_len.max(1) {
            self.window.pop_front();
        }

        let context = self.context();
        let assessment = match svc.classifier.classify(&context, self.window.make_contiguous()) {
            Ok(assessment) => assessment,
            Err(fault) => {
                let offending = fault.offending_seq(latest_seq);
                log::warn!(
                    "Skipping window of {} at observation {}: {}",
                    self.record.id,
                    offending,
                    fault
                );
                // The window was valid before this observation
                self.window.pop_back();
                record(
                    svc,
                    AuditEvent::ClassificationFault {
                        subject: self.record.id,
                        observation_seq: offending,
                        reason: fault.to_string(),
                    },
                );
                return None;
            }
        };

        let assessment_seq = match svc.ledger.append(&AuditEvent::AssessmentProduced {
            assessment: assessment.clone(),
        }) {
            Ok(seq) => Some(seq),
            Err(e) => {
                log::error!("Failed to record assessment for {}: {}", self.record.id, e);
                None
            }
        };

        let held_before = self.machine.held_escalations();
        let escalation_allowed = svc.ledger.is_durable();
        let outcome = self
            .machine
            .on_assessment(&assessment, assessment_seq, escalation_allowed);
        if self.machine.held_escalations() > held_before {
            svc.alerts.raise(
                Alert::new(
                    AlertKind::EscalationHeld,
                    AlertLevel::High,
                    "Escalation held",
                    format!(
                        "{} reached {} but the ledger cannot record durably; no request issued",
                        self.record.name, assessment.severity
                    ),
                )
                .with_subject(self.record.id, &self.record.name),
            );
        }
        for transition in outcome.transitions {
            self.apply(transition, svc);
        }
        self.last_assessment = Some(assessment.clone());

        if !outcome.escalate {
            return None;
        }

        let nonce = svc.gateway.issue_nonce();
        let action = svc.executor.config().action_for(assessment.severity);
        let summary = assessment.summary();
        let request = AuthorizationRequest::new(
            nonce,
            &self.record,
            action,
            assessment,
            assessment_seq,
            svc.gateway.request_ttl(),
        );
        self.machine.bind_request(nonce);
        svc.alerts.raise(
            Alert::new(
                AlertKind::EscalationRequested,
                AlertLevel::High,
                "Authorization requested",
                format!("{} of {} ({}), nonce {}", action, self.record.name, summary, nonce),
            )
            .with_subject(self.record.id, &self.record.name),
        );
        Some(request)
    }

    /// Returns the grant to execute when the request was approved
    pub fn on_resolution(&mut self, resolution: Resolution, svc: &Services) -> Option<AuthorizationGrant> {
        let nonce = resolution.nonce();
        let decision = resolution.decision();
        let Some(transition) = self.machine.on_resolution(nonce, decision) else {
            log::warn!(
                "Resolution {} for nonce {} no longer applies to {} in {}",
                decision,
                nonce,
                self.record.id,
                self.state()
            );
            return None;
        };
        self.apply(transition, svc);

        match decision {
            Decision::Approved => resolution.into_grant(),
            Decision::Denied => {
                let reason = resolution
                    .record()
                    .reason
                    .map(|r| format!("{:?}", r))
                    .unwrap_or_default();
                svc.alerts.raise(
                    Alert::new(
                        AlertKind::AuthorizationDenied,
                        AlertLevel::Medium,
                        "Authorization denied",
                        format!("nonce {} for {} denied ({})", nonce, self.record.name, reason),
                    )
                    .with_subject(self.record.id, &self.record.name),
                );
                None
            }
            Decision::Expired => {
                svc.alerts.raise(
                    Alert::new(
                        AlertKind::AuthorizationExpired,
                        AlertLevel::Medium,
                        "Authorization expired",
                        format!("nonce {} for {} expired without a response", nonce, self.record.name),
                    )
                    .with_subject(self.record.id, &self.record.name),
                );
                None
            }
        }
    }

    pub fn on_submission_failed(&mut self, nonce: u64, reason: &str, svc: &Services) {
        if let Some(transition) = self.machine.on_submission_failed(nonce, reason) {
            self.apply(transition, svc);
        }
    }

    pub fn on_containment(&mut self, result: Result<ActionRecord, ContainmentError>, svc: &Services) {
        match result {
            Ok(action) => {
                match self.machine.on_action(&action) {
                    Some(transition) => {
                        self.apply(transition, svc);
                        svc.alerts.raise(
                            Alert::new(
                                AlertKind::ContainmentExecuted,
                                AlertLevel::High,
                                "Subject contained",
                                format!("{} of {} succeeded", action.action, self.record.name),
                            )
                            .with_subject(self.record.id, &self.record.name),
                        );
                    }
                    None => self.containment_fault(
                        &format!(
                            "{} failed: {}",
                            action.action,
                            action.error.as_deref().unwrap_or("unknown error")
                        ),
                        svc,
                    ),
                }
                self.last_action = Some(action);
            }
            Err(e) => self.containment_fault(&format!("action refused: {}", e), svc),
        }
    }

    pub fn on_exit(&mut self, svc: &Services) {
        let pending = self.machine.pending_nonce();
        if let Some(transition) = self.machine.on_exit() {
            self.apply(transition, svc);
        }
        if let Some(nonce) = pending {
            svc.gateway.withdraw(nonce);
        }
    }

    fn containment_fault(&self, message: &str, svc: &Services) {
        svc.alerts.raise(
            Alert::new(
                AlertKind::ContainmentFault,
                AlertLevel::Critical,
                "Containment failed",
                format!("{}: {}; subject left pending containment", self.record.name, message),
            )
            .with_subject(self.record.id, &self.record.name)
            .fatal(),
        );
    }

    fn context(&self) -> SubjectContext {
        SubjectContext {
            id: self.record.id,
            name: self.record.name.clone(),
            exe_path: self.record.exe_path.clone(),
            image_hash: self.record.image_hash.clone(),
            lineage_hashes: self.record.lineage_hashes.clone(),
            profile: self.profile.clone(),
        }
    }

    fn apply(&mut self, transition: Transition, svc: &Services) {
        self.record.state = transition.to;
        record(
            svc,
            AuditEvent::StateTransition {
                subject: transition.subject,
                from: transition.from,
                to: transition.to,
                cause: transition.cause,
            },
        );
    }
}

fn record(svc: &Services, event: AuditEvent) {
    if let Err(e) = svc.ledger.append(&event) {
        log::error!("Failed to record {}: {}", event.kind(), e);
    }
}
