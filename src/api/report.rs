//! Operator report
//!
//! Snapshot of subjects, outstanding requests, alerts and the ledger tail.
//! Written as JSON plus a plain-text rendering.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::logic::alerts::Alert;
use crate::logic::authorization::AuthorizationRequest;
use crate::logic::engine::{Guardian, SubjectSnapshot};
use crate::logic::ledger::LedgerStatus;
use crate::logic::response::QuarantineEntry;

const RECENT_ALERTS: usize = 50;
const RECENT_ENTRIES: usize = 25;

/// Ledger entry as shown to the operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub seq: u64,
    pub kind: String,
    pub recorded_at: DateTime<Utc>,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorReport {
    pub generated_at: DateTime<Utc>,
    pub hostname: Option<String>,
    pub version: String,
    pub ledger: LedgerStatus,
    pub subjects: Vec<SubjectSnapshot>,
    pub archived: Vec<SubjectSnapshot>,
    pub pending_requests: Vec<AuthorizationRequest>,
    pub unresolved_alerts: Vec<Alert>,
    pub recent_alerts: Vec<Alert>,
    pub quarantine: Vec<QuarantineEntry>,
    pub recent_entries: Vec<EntrySummary>,
}

impl OperatorReport {
    pub fn collect(guardian: &Guardian) -> Self {
        let svc = guardian.services();
        let mut pending_requests = svc.gateway.outstanding();
        pending_requests.sort_by_key(|r| r.nonce);

        Self {
            generated_at: Utc::now(),
            hostname: (*constants::HOSTNAME).clone(),
            version: constants::APP_VERSION.to_string(),
            ledger: svc.ledger.status(),
            subjects: svc.board.live(),
            archived: svc.board.archived(),
            pending_requests,
            unresolved_alerts: svc.alerts.unresolved(),
            recent_alerts: svc.alerts.recent(RECENT_ALERTS),
            quarantine: svc.executor.vault().list(),
            recent_entries: svc
                .ledger
                .recent(RECENT_ENTRIES)
                .into_iter()
                .map(|e| EntrySummary {
                    recorded_at: e.recorded_at(),
                    seq: e.seq,
                    kind: e.kind,
                    hash: e.hash,
                })
                .collect(),
        }
    }

    /// Write both renderings into `dir`; returns the JSON path
    pub fn write(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_path = dir.join(constants::REPORT_FILE);
        replace(&json_path, &json)?;
        replace(&dir.join(constants::REPORT_TEXT_FILE), self.render_text().as_bytes())?;
        Ok(json_path)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} v{} on {} at {}",
            constants::APP_NAME,
            self.version,
            self.hostname.as_deref().unwrap_or("unknown host"),
            self.generated_at.to_rfc3339()
        );
        let _ = writeln!(
            out,
            "Ledger: {} entries, {} buffered, {} ({})",
            self.ledger.entries,
            self.ledger.pending,
            if self.ledger.durable { "durable" } else { "NOT DURABLE" },
            self.ledger.location
        );

        if !self.unresolved_alerts.is_empty() {
            let _ = writeln!(out, "\n!! UNRESOLVED ALERTS");
            for alert in &self.unresolved_alerts {
                let _ = writeln!(
                    out,
                    "  [{}] {} {}: {}",
                    alert.level,
                    alert.raised_at.to_rfc3339(),
                    alert.title,
                    alert.message
                );
            }
        }

        let _ = writeln!(out, "\nSubjects ({})", self.subjects.len());
        for s in &self.subjects {
            let severity = s
                .last_assessment
                .as_ref()
                .map(|a| a.summary())
                .unwrap_or_else(|| "not assessed".to_string());
            let _ = writeln!(
                out,
                "  {:<12} {:<22} {} ({})",
                s.record.id.to_string(),
                s.state.as_str(),
                s.record.name,
                severity
            );
            if let Some(nonce) = s.pending_nonce {
                let _ = writeln!(out, "    awaiting authorization, nonce {}", nonce);
            }
            if s.held_escalations > 0 {
                let _ = writeln!(out, "    {} escalation(s) held while ledger not durable", s.held_escalations);
            }
        }

        if !self.pending_requests.is_empty() {
            let _ = writeln!(out, "\nPending authorization requests");
            for r in &self.pending_requests {
                let _ = writeln!(
                    out,
                    "  nonce {} {} {} ({}) expires {}",
                    r.nonce,
                    r.action,
                    r.subject,
                    r.subject_name,
                    r.expires_at.to_rfc3339()
                );
            }
        }

        if !self.quarantine.is_empty() {
            let _ = writeln!(out, "\nQuarantine");
            for q in &self.quarantine {
                let _ = writeln!(
                    out,
                    "  {} {} -> {}",
                    q.id,
                    q.original_path.display(),
                    q.quarantine_path.display()
                );
            }
        }

        if !self.archived.is_empty() {
            let _ = writeln!(out, "\nArchived ({})", self.archived.len());
            for s in self.archived.iter().take(20) {
                let _ = writeln!(out, "  {:<12} {:<22} {}", s.record.id.to_string(), s.state.as_str(), s.record.name);
            }
        }

        let _ = writeln!(out, "\nRecent ledger entries");
        for e in &self.recent_entries {
            let _ = writeln!(out, "  #{:<6} {} {}", e.seq, e.recorded_at.to_rfc3339(), e.kind);
        }
        out
    }
}

/// Write to a temp file and rename so readers never see a partial report
fn replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logic::config::GuardianConfig;
    use crate::logic::ledger::Ledger;
    use crate::logic::testing::{registry, FakeHost, RecordingChannel};

    fn guardian(work: &Path) -> (Arc<FakeHost>, Guardian) {
        let mut config = GuardianConfig::default();
        config.observer.watch_patterns = vec!["^agent$".to_string()];
        config.observer.interval_ms = 1_000;
        config.containment.quarantine_dir = Some(work.join("vault"));
        let host = Arc::new(FakeHost::new());
        let guardian = Guardian::from_config(
            &config,
            host.clone(),
            Arc::new(registry()),
            Arc::new(RecordingChannel::new()),
            Arc::new(Ledger::in_memory()),
        )
        .unwrap();
        (host, guardian)
    }

    #[tokio::test]
    async fn test_report_lists_subjects_and_ledger_tail() {
        let work = tempfile::tempdir().unwrap();
        let (host, guardian) = guardian(work.path());
        host.spawn(4201, "agent", None, "c0de");
        host.spawn(4202, "editor", None, "beef");
        guardian.run_cycle().await;

        let report = OperatorReport::collect(&guardian);
        assert_eq!(report.subjects.len(), 1);
        assert_eq!(report.subjects[0].record.name, "agent");
        assert!(report.pending_requests.is_empty());
        assert!(report.ledger.durable);
        assert_eq!(report.recent_entries.last().unwrap().seq + 1, report.ledger.entries);
        assert!(report.recent_entries.iter().any(|e| e.kind == "subject_discovered"));

        let text = report.render_text();
        assert!(text.contains("Subjects (1)"));
        assert!(text.contains("observed"));
        assert!(!text.contains("UNRESOLVED"));
    }

    #[tokio::test]
    async fn test_write_replaces_both_files() {
        let work = tempfile::tempdir().unwrap();
        let (_host, guardian) = guardian(work.path());
        guardian.run_cycle().await;
        let out = work.path().join("reports");

        let first = OperatorReport::collect(&guardian).write(&out).unwrap();
        let second = OperatorReport::collect(&guardian).write(&out).unwrap();
        assert_eq!(first, second);

        let parsed: OperatorReport = serde_json::from_slice(&fs::read(&second).unwrap()).unwrap();
        assert_eq!(parsed.version, constants::APP_VERSION);
        assert!(out.join(constants::REPORT_TEXT_FILE).exists());
        let leftovers = fs::read_dir(&out)
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .count();
        assert_eq!(leftovers, 0);
    }
}
