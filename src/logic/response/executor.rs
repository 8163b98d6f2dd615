//! Containment Executor
//!
//! Runs an approved action against a subject. It only accepts an
//! `AuthorizationGrant`, which the gateway hands out after the approval
//! is durably on the ledger.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::quarantine::QuarantineVault;
use super::types::{ActionRecord, ActionStatus, ContainmentConfig, ContainmentError, QuarantineEntry, StopMethod};
use crate::logic::authorization::{AuthorizationGrant, ContainmentAction};
use crate::logic::ledger::{AuditEvent, Ledger};
use crate::logic::observer::{ControlSignal, HostError, ProcessControl, SubjectId};

pub struct ContainmentExecutor {
    control: Arc<dyn ProcessControl>,
    vault: QuarantineVault,
    ledger: Arc<Ledger>,
    config: ContainmentConfig,
    executed: Mutex<HashSet<u64>>,
}

impl ContainmentExecutor {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        vault: QuarantineVault,
        ledger: Arc<Ledger>,
        config: ContainmentConfig,
    ) -> Self {
        // Approvals already acted on in earlier runs stay spent
        let executed = ledger
            .events_of_kind("containment_executed")
            .into_iter()
            .filter_map(|(_, event)| match event {
                AuditEvent::ContainmentExecuted { record } => Some(record.nonce),
                _ => None,
            })
            .collect();

        Self {
            control,
            vault,
            ledger,
            config,
            executed: Mutex::new(executed),
        }
    }

    pub fn vault(&self) -> &QuarantineVault {
        &self.vault
    }

    pub fn config(&self) -> &ContainmentConfig {
        &self.config
    }

    /// Carry out an approved action. Refusals happen before anything on the
    /// host is touched and return `Err`; an attempted action always yields
    /// a recorded `ActionRecord`, succeeded or failed.
    pub fn execute(&self, grant: AuthorizationGrant) -> Result<ActionRecord, ContainmentError> {
        let request = grant.request();
        let required = self.config.min_severity(request.action);
        let actual = request.justification.severity;
        if actual < required {
            log::warn!(
                "Refusing {} of {}: severity {} below {}",
                request.action,
                request.subject,
                actual,
                required
            );
            return Err(ContainmentError::BelowThreshold {
                action: request.action,
                required,
                actual,
            });
        }

        if !self.ledger.is_durable() {
            log::error!(
                "Refusing {} of {}: ledger cannot record durably",
                request.action,
                request.subject
            );
            return Err(ContainmentError::LedgerUnavailable(self.ledger.status().location));
        }

        if !self.executed.lock().insert(request.nonce) {
            return Err(ContainmentError::AlreadyExecuted(request.nonce));
        }

        let started_at = Utc::now();
        let mut steps = Vec::new();
        // Set as soon as the image is in the vault, whatever happens after
        let mut quarantine = None;
        let outcome = match request.action {
            ContainmentAction::Terminate => self.terminate(&request.subject, &mut steps).map(Some),
            ContainmentAction::Quarantine => self
                .quarantine(
                    &request.subject,
                    request.image_path.as_ref(),
                    request.nonce,
                    &mut quarantine,
                    &mut steps,
                )
                .map(|()| None),
        };

        let (status, stop_method, error) = match outcome {
            Ok(stop_method) => (ActionStatus::Succeeded, stop_method, None),
            Err(e) => {
                log::error!("{} of {} failed: {}", request.action, request.subject, e);
                (ActionStatus::Failed, None, Some(e.to_string()))
            }
        };

        let record = ActionRecord {
            action_id: Uuid::new_v4(),
            request_id: request.request_id,
            nonce: request.nonce,
            subject: request.subject,
            action: request.action,
            operator_id: grant.operator_id().to_string(),
            approval_seq: grant.approval_seq(),
            status,
            stop_method,
            quarantine,
            steps,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        self.record(AuditEvent::ContainmentExecuted { record: record.clone() });

        log::warn!(
            "Containment {} of {} {} (authorized by {}, nonce {})",
            record.action,
            record.subject,
            record.status.as_str(),
            record.operator_id,
            record.nonce
        );
        Ok(record)
    }

    /// Undo a quarantine: move the image back and let the process continue
    pub fn restore(&self, record: &ActionRecord) -> Result<PathBuf, ContainmentError> {
        let entry = record
            .quarantine
            .as_ref()
            .filter(|e| e.can_restore)
            .ok_or(ContainmentError::NotRestorable(record.action_id))?;

        let restored_to = self.vault.restore(entry)?;
        match self.control.signal(&record.subject, ControlSignal::Resume) {
            Ok(()) | Err(HostError::NotFound(_)) => {}
            Err(e) => log::warn!("Failed to resume {} after restore: {}", record.subject, e),
        }

        self.record(AuditEvent::QuarantineRestored {
            action_id: record.action_id,
            subject: record.subject,
            restored_to: restored_to.clone(),
        });
        Ok(restored_to)
    }

    // ========================================================================
    // ACTIONS
    // ========================================================================

    fn terminate(&self, subject: &SubjectId, steps: &mut Vec<String>) -> Result<StopMethod, ContainmentError> {
        if !self.send(subject, ControlSignal::Terminate, steps)? {
            return Ok(StopMethod::AlreadyExited);
        }
        if self.wait_for_exit(subject, self.config.grace_period_ms) {
            steps.push("exited after SIGTERM".to_string());
            return Ok(StopMethod::Graceful);
        }

        steps.push(format!("still running after {}ms grace", self.config.grace_period_ms));
        if !self.send(subject, ControlSignal::Kill, steps)? {
            return Ok(StopMethod::Forced);
        }
        if self.wait_for_exit(subject, self.config.kill_wait_ms) {
            steps.push("exited after SIGKILL".to_string());
            return Ok(StopMethod::Forced);
        }
        Err(ContainmentError::StillRunning(*subject))
    }

    fn quarantine(
        &self,
        subject: &SubjectId,
        image: Option<&PathBuf>,
        nonce: u64,
        moved: &mut Option<QuarantineEntry>,
        steps: &mut Vec<String>,
    ) -> Result<(), ContainmentError> {
        let image = image.ok_or(ContainmentError::NoImage(*subject))?;
        let entry = self.vault.quarantine(image, *subject, nonce)?;
        steps.push(format!(
            "moved {} to {}",
            entry.original_path.display(),
            entry.quarantine_path.display()
        ));
        *moved = Some(entry);

        if self.send(subject, ControlSignal::Suspend, steps)? {
            steps.push("process suspended".to_string());
        }
        Ok(())
    }

    /// `Ok(false)` when the process was already gone
    fn send(&self, subject: &SubjectId, signal: ControlSignal, steps: &mut Vec<String>) -> Result<bool, ContainmentError> {
        match self.control.signal(subject, signal) {
            Ok(()) => {
                steps.push(format!("sent {}", signal));
                Ok(true)
            }
            Err(HostError::NotFound(_)) => {
                steps.push(format!("{} not delivered, process already exited", signal));
                Ok(false)
            }
            Err(e) => Err(ContainmentError::Signal(e.to_string())),
        }
    }

    fn wait_for_exit(&self, subject: &SubjectId, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            if !self.control.is_running(subject) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(poll);
        }
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.ledger.append_durable(&event) {
            log::error!("Durable write of {} failed, buffering: {}", event.kind(), e);
            if let Err(e) = self.ledger.append(&event) {
                log::error!("Failed to record {}: {}", event.kind(), e);
            }
        }
    }
}
