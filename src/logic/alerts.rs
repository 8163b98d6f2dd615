//! Operator alerts
//!
//! Every alert is written to the ledger and kept on a bounded board that
//! the operator report reads. Fatal alerts stay until acknowledged.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logic::ledger::{AuditEvent, Ledger};
use crate::logic::observer::SubjectId;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LivenessFault,
    ClassificationFault,
    EscalationRequested,
    EscalationHeld,
    AuthorizationDenied,
    AuthorizationExpired,
    ContainmentExecuted,
    ContainmentFault,
    LedgerDegraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub subject: Option<SubjectId>,
    pub subject_name: Option<String>,
    pub hostname: Option<String>,
    pub raised_at: DateTime<Utc>,
    /// Needs an operator; stays on the report until acknowledged
    pub fatal: bool,
}

impl Alert {
    pub fn new(kind: AlertKind, level: AlertLevel, title: &str, message: impl Into<String>) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            kind,
            level,
            title: title.to_string(),
            message: message.into(),
            subject: None,
            subject_name: None,
            hostname: (*crate::constants::HOSTNAME).clone(),
            raised_at: Utc::now(),
            fatal: false,
        }
    }

    pub fn with_subject(mut self, subject: SubjectId, name: &str) -> Self {
        self.subject = Some(subject);
        self.subject_name = Some(name.to_string());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

// ============================================================================
// BOARD
// ============================================================================

pub struct AlertBoard {
    ledger: Arc<Ledger>,
    recent: RwLock<VecDeque<Alert>>,
    unresolved: RwLock<Vec<Alert>>,
    capacity: usize,
}

impl AlertBoard {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self::with_capacity(ledger, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ledger: Arc<Ledger>, capacity: usize) -> Self {
        Self {
            ledger,
            recent: RwLock::new(VecDeque::new()),
            unresolved: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn raise(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Critical | AlertLevel::High => {
                log::error!("[ALERT {}] {}: {}", alert.level, alert.title, alert.message)
            }
            AlertLevel::Medium => log::warn!("[ALERT {}] {}: {}", alert.level, alert.title, alert.message),
            AlertLevel::Low | AlertLevel::Info => {
                log::info!("[ALERT {}] {}: {}", alert.level, alert.title, alert.message)
            }
        }

        if let Err(e) = self.ledger.append(&AuditEvent::AlertRaised { alert: alert.clone() }) {
            log::error!("Failed to record alert {}: {}", alert.alert_id, e);
        }

        if alert.fatal {
            self.unresolved.write().push(alert.clone());
        }
        let mut recent = self.recent.write();
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(alert);
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.recent.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn unresolved(&self) -> Vec<Alert> {
        self.unresolved.read().clone()
    }

    pub fn acknowledge(&self, alert_id: Uuid) -> bool {
        let mut unresolved = self.unresolved.write();
        let before = unresolved.len();
        unresolved.retain(|a| a.alert_id != alert_id);
        unresolved.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alerts_are_recorded_and_bounded() {
        let ledger = Arc::new(Ledger::in_memory());
        let board = AlertBoard::with_capacity(ledger.clone(), 2);
        for n in 0..3 {
            board.raise(Alert::new(
                AlertKind::LivenessFault,
                AlertLevel::High,
                "Process table unreadable",
                format!("attempt {}", n),
            ));
        }
        assert_eq!(ledger.events_of_kind("alert_raised").len(), 3);
        let recent = board.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "attempt 2");
    }

    #[test]
    fn test_fatal_alerts_wait_for_acknowledgement() {
        let board = AlertBoard::new(Arc::new(Ledger::in_memory()));
        let alert = Alert::new(
            AlertKind::ContainmentFault,
            AlertLevel::Critical,
            "Containment failed",
            "process still running",
        )
        .with_subject(SubjectId::new(5, 6), "agent")
        .fatal();
        let id = alert.alert_id;
        board.raise(alert);
        board.raise(Alert::new(AlertKind::EscalationRequested, AlertLevel::High, "Escalation", "nonce 1"));

        assert_eq!(board.unresolved().len(), 1);
        assert!(board.acknowledge(id));
        assert!(!board.acknowledge(id));
        assert!(board.unresolved().is_empty());
    }
}
