//! Engine scenario tests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::logic::alerts::AlertKind;
use crate::logic::authorization::{verify_provenance, ChannelResponse, Decision, DenialReason, Verdict};
use crate::logic::config::GuardianConfig;
use crate::logic::ledger::{AuditEvent, Ledger, MemoryStorage};
use crate::logic::lifecycle::{SubjectState, TransitionCause};
use crate::logic::observer::{ChildSpawn, SubjectId};
use crate::logic::testing::{operator_key, registry, sign, FakeHost, RecordingChannel, OPERATOR};

const AGENT_HASH: &str = "a9e1c0ffee";

struct Fixture {
    host: Arc<FakeHost>,
    storage: Arc<MemoryStorage>,
    ledger: Arc<Ledger>,
    channel: Arc<RecordingChannel>,
    config: GuardianConfig,
    guardian: Guardian,
    work: tempfile::TempDir,
}

fn test_config(work: &Path) -> GuardianConfig {
    let mut config = GuardianConfig::default();
    config.observer.interval_ms = 1_000;
    config.observer.enumerate_retries = 1;
    config.observer.probe_timeout_ms = 500;
    config.observer.watch_patterns = vec!["^agent$".to_string()];
    config.authorization.poll_interval_ms = 20;
    config.containment.quarantine_dir = Some(work.join("vault"));
    config.containment.grace_period_ms = 50;
    config.containment.kill_wait_ms = 50;
    config.containment.poll_interval_ms = 5;
    config
}

fn fixture_with(adjust: impl FnOnce(&mut GuardianConfig)) -> Fixture {
    let work = tempfile::tempdir().unwrap();
    let mut config = test_config(work.path());
    adjust(&mut config);

    let host = Arc::new(FakeHost::new());
    let storage = Arc::new(MemoryStorage::new());
    let ledger = Arc::new(Ledger::with_storage(storage.clone()));
    let channel = Arc::new(RecordingChannel::new());
    let guardian = Guardian::from_config(
        &config,
        host.clone(),
        Arc::new(registry()),
        channel.clone(),
        ledger.clone(),
    )
    .unwrap();

    Fixture {
        host,
        storage,
        ledger,
        channel,
        config,
        guardian,
        work,
    }
}

fn fixture() -> Fixture {
    fixture_with(|_| {})
}

impl Fixture {
    fn agent(&self, pid: u32) -> (SubjectId, PathBuf) {
        let exe = self.work.path().join(format!("agent-{}", pid));
        std::fs::write(&exe, b"#!/bin/sh\nexec model-runner\n").unwrap();
        (self.host.spawn(pid, "agent", Some(&exe), AGENT_HASH), exe)
    }

    /// Three children running the agent's own image
    fn replicate(&self, id: SubjectId, round: u32) {
        let spawns = (0..3)
            .map(|i| ChildSpawn {
                child: SubjectId::new(9_000 + round * 10 + i, 1),
                name: "agent".to_string(),
                image_hash: Some(AGENT_HASH.to_string()),
            })
            .collect();
        self.host.queue_spawns(id, spawns);
    }

    fn state(&self, id: SubjectId) -> SubjectState {
        self.guardian.services().board.get(&id).unwrap().state
    }

    fn transitions_of(&self, id: SubjectId) -> Vec<(SubjectState, SubjectState)> {
        self.ledger
            .events_of_kind("state_transition")
            .into_iter()
            .filter_map(|(_, event)| match event {
                AuditEvent::StateTransition { subject, from, to, .. } if subject == id => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    fn alerts_of(&self, kind: AlertKind) -> usize {
        self.guardian
            .services()
            .alerts
            .recent(100)
            .iter()
            .filter(|a| a.kind == kind)
            .count()
    }

    async fn wait_for(&self, id: SubjectId, state: SubjectState) -> SubjectSnapshot {
        for _ in 0..300 {
            if let Some(snapshot) = self.guardian.services().board.get(&id) {
                if snapshot.state == state {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subject {} never reached {}", id, state);
    }

    async fn wait_archived(&self) -> Vec<SubjectSnapshot> {
        let board = &self.guardian.services().board;
        for _ in 0..300 {
            if board.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        board.archived()
    }

    /// Drive a replicating agent to pending authorization
    async fn escalate(&self, id: SubjectId) {
        for round in 0..3 {
            self.replicate(id, round);
            self.guardian.run_cycle().await;
        }
        assert_eq!(self.state(id), SubjectState::PendingAuthorization);
    }
}

#[tokio::test]
async fn test_single_self_modification_decays_back_to_observed() {
    let f = fixture();
    let (id, _) = f.agent(4101);

    let summary = f.guardian.run_cycle().await;
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.observed, 1);
    assert_eq!(f.state(id), SubjectState::Observed);

    f.host.update(id, |p| p.probe.image_hash = Some("b7d2feed".to_string()));
    f.guardian.run_cycle().await;
    let snapshot = f.guardian.services().board.get(&id).unwrap();
    assert_eq!(snapshot.state, SubjectState::Suspicious);
    assert_eq!(snapshot.record.image_hash.as_deref(), Some("b7d2feed"));

    f.guardian.run_cycle().await;
    assert_eq!(f.state(id), SubjectState::Suspicious);
    f.guardian.run_cycle().await;
    assert_eq!(f.state(id), SubjectState::Observed);

    assert!(f.channel.delivered().is_empty());
    assert!(f.ledger.events_of_kind("authorization_submitted").is_empty());
    assert_eq!(f.ledger.events_of_kind("assessment_produced").len(), 4);
}

#[tokio::test]
async fn test_replication_is_quarantined_after_approval() {
    let f = fixture();
    let (id, exe) = f.agent(4102);
    f.escalate(id).await;

    let request = f.channel.next_request(0).await;
    assert_eq!(request.subject, id);
    assert_eq!(request.nonce, 1);
    f.channel.push_response(ChannelResponse::Signed(sign(
        &request,
        Verdict::Approve,
        &operator_key(),
        OPERATOR,
    )));
    assert_eq!(f.guardian.services().gateway.poll_channel(), 1);

    let snapshot = f.wait_for(id, SubjectState::Quarantined).await;
    let action = snapshot.last_action.unwrap();
    assert!(action.succeeded());
    assert!(!exe.exists());
    assert!(f.host.process(id).unwrap().suspended);

    assert_eq!(
        f.transitions_of(id),
        vec![
            (SubjectState::Observed, SubjectState::Suspicious),
            (SubjectState::Suspicious, SubjectState::Flagged),
            (SubjectState::Flagged, SubjectState::PendingAuthorization),
            (SubjectState::PendingAuthorization, SubjectState::ContainmentPending),
            (SubjectState::ContainmentPending, SubjectState::Quarantined),
        ]
    );
    assert_eq!(f.alerts_of(AlertKind::EscalationRequested), 1);
    assert_eq!(f.alerts_of(AlertKind::ContainmentExecuted), 1);

    let report = verify_provenance(&f.ledger.read(..), &registry(), &f.config.containment).unwrap();
    assert_eq!(report.approvals_verified, 1);
    assert_eq!(report.actions_verified, 1);
}

#[tokio::test]
async fn test_unanswered_request_expires_back_to_flagged() {
    let f = fixture_with(|c| c.authorization.request_ttl_secs = 1);
    let (id, exe) = f.agent(4103);
    f.escalate(id).await;
    f.channel.next_request(0).await;

    f.wait_for(id, SubjectState::Flagged).await;

    let decisions: Vec<Decision> = f
        .ledger
        .events_of_kind("authorization_decided")
        .into_iter()
        .filter_map(|(_, event)| match event {
            AuditEvent::AuthorizationDecided { record } => Some(record.decision),
            _ => None,
        })
        .collect();
    assert_eq!(decisions, vec![Decision::Expired]);
    assert!(f.ledger.events_of_kind("containment_executed").is_empty());
    assert!(exe.exists());
    assert!(f.host.signals().is_empty());
    assert_eq!(f.alerts_of(AlertKind::AuthorizationExpired), 1);
}

#[tokio::test]
async fn test_operator_denial_leaves_subject_running() {
    let f = fixture();
    let (id, exe) = f.agent(4104);
    f.escalate(id).await;

    let request = f.channel.next_request(0).await;
    f.channel
        .push_response(ChannelResponse::Signed(sign(&request, Verdict::Deny, &operator_key(), OPERATOR)));
    f.guardian.services().gateway.poll_channel();

    let snapshot = f.wait_for(id, SubjectState::Flagged).await;
    assert_eq!(snapshot.pending_nonce, None);
    assert!(snapshot.last_action.is_none());
    assert!(exe.exists());
    assert!(f.host.signals().is_empty());
    assert_eq!(f.alerts_of(AlertKind::AuthorizationDenied), 1);
}

#[tokio::test]
async fn test_exit_while_flagged_archives_subject() {
    let f = fixture();
    let (id, _) = f.agent(4105);
    for round in 0..2 {
        f.replicate(id, round);
        f.guardian.run_cycle().await;
    }
    assert_eq!(f.state(id), SubjectState::Flagged);

    f.host.exit(id);
    let summary = f.guardian.run_cycle().await;
    assert_eq!(summary.exited, 1);
    assert_eq!(summary.tracked, 0);

    let archived = f.wait_archived().await;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].state, SubjectState::ExitedNaturally);
    assert_eq!(f.ledger.events_of_kind("subject_archived").len(), 1);
    assert!(f.channel.delivered().is_empty());
}

#[tokio::test]
async fn test_unreadable_process_table_raises_liveness_alert() {
    let f = fixture();
    let (id, _) = f.agent(4106);
    f.guardian.run_cycle().await;

    f.host.set_enumeration_down(true);
    let summary = f.guardian.run_cycle().await;
    assert!(summary.liveness_fault.is_some());
    assert_eq!(summary.observed, 1);
    assert_eq!(f.alerts_of(AlertKind::LivenessFault), 1);

    // Degraded windows hold the state
    let snapshot = f.guardian.services().board.get(&id).unwrap();
    assert_eq!(snapshot.state, SubjectState::Observed);
    assert_eq!(snapshot.observations, 2);

    f.host.set_enumeration_down(false);
    let summary = f.guardian.run_cycle().await;
    assert!(summary.liveness_fault.is_none());
    assert_eq!(summary.discovered, 0);
    assert_eq!(f.alerts_of(AlertKind::LivenessFault), 1);
}

#[tokio::test]
async fn test_escalation_held_until_ledger_recovers() {
    let f = fixture();
    let (id, _) = f.agent(4107);
    for round in 0..2 {
        f.replicate(id, round);
        f.guardian.run_cycle().await;
    }
    assert_eq!(f.state(id), SubjectState::Flagged);

    f.storage.set_available(false);
    f.replicate(id, 2);
    let summary = f.guardian.run_cycle().await;
    assert!(!summary.ledger_durable);
    let snapshot = f.guardian.services().board.get(&id).unwrap();
    assert_eq!(snapshot.state, SubjectState::Flagged);
    assert_eq!(snapshot.held_escalations, 1);
    assert_eq!(f.alerts_of(AlertKind::EscalationHeld), 1);
    assert_eq!(f.alerts_of(AlertKind::LedgerDegraded), 1);
    assert!(f.channel.delivered().is_empty());

    f.storage.set_available(true);
    f.replicate(id, 3);
    let summary = f.guardian.run_cycle().await;
    assert!(summary.ledger_durable);
    assert_eq!(f.state(id), SubjectState::PendingAuthorization);
    let request = f.channel.next_request(0).await;
    assert_eq!(request.subject, id);
    assert_eq!(f.alerts_of(AlertKind::LedgerDegraded), 1);
}

#[tokio::test]
async fn test_run_loop_pumps_channel_until_shutdown() {
    let f = fixture_with(|c| c.observer.interval_ms = 30);
    let (id, _) = f.agent(4108);
    f.escalate(id).await;

    let request = f.channel.next_request(0).await;
    f.channel.push_response(ChannelResponse::Signed(sign(
        &request,
        Verdict::Approve,
        &operator_key(),
        OPERATOR,
    )));

    let mut cycles = 0;
    f.guardian
        .run(tokio::time::sleep(Duration::from_millis(400)), |_, _| cycles += 1)
        .await;

    assert!(cycles >= 2);
    assert_eq!(f.state(id), SubjectState::Quarantined);
    assert_eq!(f.ledger.pending(), 0);
}

#[tokio::test]
async fn test_exit_while_pending_withdraws_request() {
    let f = fixture();
    let (id, exe) = f.agent(4109);
    f.escalate(id).await;
    let request = f.channel.next_request(0).await;
    assert_eq!(f.guardian.services().gateway.outstanding().len(), 1);

    f.host.exit(id);
    f.guardian.run_cycle().await;
    let archived = f.wait_archived().await;
    assert_eq!(archived[0].state, SubjectState::ExitedNaturally);

    let gateway = &f.guardian.services().gateway;
    for _ in 0..300 {
        if gateway.outstanding().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gateway.outstanding().is_empty());
    let reasons: Vec<Option<DenialReason>> = f
        .ledger
        .events_of_kind("authorization_decided")
        .into_iter()
        .filter_map(|(_, event)| match event {
            AuditEvent::AuthorizationDecided { record } => Some(record.reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![Some(DenialReason::SubjectExited)]);

    // A late approval is refused and nothing is touched
    assert!(gateway
        .receive(sign(&request, Verdict::Approve, &operator_key(), OPERATOR))
        .is_err());
    assert!(f.ledger.events_of_kind("containment_executed").is_empty());
    assert!(exe.exists());
}

#[tokio::test]
async fn test_quarantined_subject_exit_is_not_natural() {
    let f = fixture();
    let (id, _) = f.agent(4110);
    f.escalate(id).await;
    let request = f.channel.next_request(0).await;
    f.channel.push_response(ChannelResponse::Signed(sign(
        &request,
        Verdict::Approve,
        &operator_key(),
        OPERATOR,
    )));
    f.guardian.services().gateway.poll_channel();
    f.wait_for(id, SubjectState::Quarantined).await;

    f.host.exit(id);
    f.guardian.run_cycle().await;
    let archived = f.wait_archived().await;
    assert_eq!(archived[0].state, SubjectState::Terminated);

    let last = f
        .ledger
        .events_of_kind("state_transition")
        .into_iter()
        .filter_map(|(_, event)| match event {
            AuditEvent::StateTransition { subject, to, cause, .. } if subject == id => Some((to, cause)),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(
        last,
        (SubjectState::Terminated, TransitionCause::ContainedExit { nonce: request.nonce })
    );
}
