//! Classifier tests

use std::path::PathBuf;

use chrono::{Duration, TimeZone, Utc};

use super::*;
use crate::logic::observer::{
    ChildSpawn, FileActivity, FileOp, Handle, HashDelta, Observation, ObservationStatus, ResourceUsage,
    SubjectId,
};

const SELF_HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn subject() -> SubjectId {
    SubjectId::new(4242, 1_700_000_000)
}

fn context(profile: SubjectProfile) -> SubjectContext {
    SubjectContext {
        id: subject(),
        name: "research-agent".to_string(),
        exe_path: Some(PathBuf::from("/opt/agent/bin/agent")),
        image_hash: Some(SELF_HASH.to_string()),
        lineage_hashes: vec!["parent-hash".to_string()],
        profile,
    }
}

fn obs(seq: u64) -> Observation {
    Observation {
        subject: subject(),
        seq,
        observed_at: Utc.timestamp_opt(1_700_000_100, 0).unwrap() + Duration::seconds(seq as i64 * 5),
        status: ObservationStatus::Ok,
        resources: ResourceUsage {
            effective_uid: Some(1000),
            ..ResourceUsage::default()
        },
        handles: Vec::new(),
        file_activity: Vec::new(),
        child_spawns: Vec::new(),
        image_hash: Some(SELF_HASH.to_string()),
        code_hash_delta: None,
    }
}

fn with_clones(mut o: Observation, count: u32) -> Observation {
    for n in 0..count {
        o.child_spawns.push(ChildSpawn {
            child: SubjectId::new(5000 + o.seq as u32 * 10 + n, 1_700_000_200),
            name: "research-agent".to_string(),
            image_hash: Some(SELF_HASH.to_string()),
        });
    }
    o
}

fn classifier() -> Classifier {
    Classifier::new(&ClassifierConfig::default()).unwrap()
}

#[test]
fn test_malformed_windows_are_faults() {
    let c = classifier();
    let ctx = context(SubjectProfile::default());

    assert_eq!(c.classify(&ctx, &[]), Err(ClassificationFault::EmptyWindow));

    let mut foreign = obs(1);
    foreign.subject = SubjectId::new(1, 1);
    assert!(matches!(
        c.classify(&ctx, &[obs(0), foreign]),
        Err(ClassificationFault::ForeignObservation { .. })
    ));

    assert_eq!(
        c.classify(&ctx, &[obs(2), obs(1)]),
        Err(ClassificationFault::OutOfOrder { previous: 2, next: 1 })
    );
}

#[test]
fn test_quiet_window_is_none() {
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[obs(0), obs(1), obs(2)])
        .unwrap();
    assert_eq!(a.severity, Severity::None);
    assert!(a.matched.is_empty());
    assert_eq!(a.observations, ObservationRange { first: 0, last: 2 });
    assert!(!a.degraded);
}

#[test]
fn test_isolated_self_modification_keeps_bucket() {
    let mut changed = obs(1);
    changed.image_hash = Some("b".repeat(64));
    changed.code_hash_delta = Some(HashDelta {
        previous: SELF_HASH.to_string(),
        current: "b".repeat(64),
    });

    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[obs(0), changed])
        .unwrap();
    assert_eq!(a.matched, vec![PatternId::SelfModification]);
    assert_eq!(a.findings[0].bucket, Severity::Medium);
    assert_eq!(a.findings[0].streak, 1);
    assert_eq!(a.severity, Severity::Medium);
}

#[test]
fn test_isolated_critical_match_is_not_lowered() {
    let mut changed = obs(1);
    changed.image_hash = Some("b".repeat(64));
    changed.code_hash_delta = Some(HashDelta {
        previous: SELF_HASH.to_string(),
        current: "b".repeat(64),
    });
    changed.file_activity.push(FileActivity {
        path: PathBuf::from("/opt/agent/bin/agent"),
        op: FileOp::Write,
        bytes: 512,
        renamed_to: None,
    });

    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[obs(0), changed])
        .unwrap();
    assert_eq!(a.findings[0].pattern, PatternId::SelfModification);
    assert_eq!(a.findings[0].streak, 1);
    assert_eq!(a.findings[0].bucket, Severity::Critical);
    assert_eq!(a.severity, Severity::Critical);
}

#[test]
fn test_expected_self_rewrite_is_not_flagged() {
    let mut changed = obs(1);
    changed.code_hash_delta = Some(HashDelta {
        previous: SELF_HASH.to_string(),
        current: "b".repeat(64),
    });
    let profile = SubjectProfile {
        self_rewrite_expected: true,
        ..SubjectProfile::default()
    };
    let a = classifier().classify(&context(profile), &[obs(0), changed]).unwrap();
    assert_eq!(a.severity, Severity::None);
}

#[test]
fn test_sustained_replication_escalates_each_window() {
    let c = classifier();
    let ctx = context(SubjectProfile::default());
    let frames: Vec<Observation> = (0..3).map(|n| with_clones(obs(n), 3)).collect();

    let first = c.classify(&ctx, &frames[..1]).unwrap();
    let second = c.classify(&ctx, &frames[..2]).unwrap();
    let third = c.classify(&ctx, &frames[..3]).unwrap();

    assert_eq!(first.findings[0].bucket, Severity::High);
    assert_eq!(first.severity, Severity::High);
    assert_eq!(second.severity, Severity::High);
    assert_eq!(third.severity, Severity::Critical);
    assert_eq!(third.findings[0].streak, 3);
}

#[test]
fn test_clones_below_threshold_do_not_match() {
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[with_clones(obs(0), 2)])
        .unwrap();
    assert!(a.matched.is_empty());
}

#[test]
fn test_uncorrelated_log_delete_stays_none() {
    let mut o = obs(0);
    o.file_activity.push(FileActivity {
        path: PathBuf::from("/var/log/syslog.log"),
        op: FileOp::Delete,
        bytes: 0,
        renamed_to: None,
    });
    let a = classifier().classify(&context(SubjectProfile::default()), &[o]).unwrap();
    assert_eq!(a.matched, vec![PatternId::Concealment]);
    // An isolated low-confidence match is suppressed
    assert_eq!(a.findings[0].bucket, Severity::Low);
    assert_eq!(a.severity, Severity::None);
}

#[test]
fn test_deleting_own_history_is_concealment() {
    let history = PathBuf::from("/home/agent/.agent_history");
    let mut wrote = obs(0);
    wrote.file_activity.push(FileActivity {
        path: history.clone(),
        op: FileOp::Write,
        bytes: 4096,
        renamed_to: None,
    });
    let mut deleted = obs(1);
    deleted.file_activity.push(FileActivity {
        path: history,
        op: FileOp::Delete,
        bytes: 0,
        renamed_to: None,
    });

    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[wrote, deleted])
        .unwrap();
    let finding = &a.findings[0];
    assert_eq!(finding.pattern, PatternId::Concealment);
    assert_eq!(finding.bucket, Severity::High);
    assert_eq!(a.severity, Severity::High);
}

#[test]
fn test_uid_elevation_is_privilege_escalation() {
    let mut root = obs(1);
    root.resources.effective_uid = Some(0);
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &[obs(0), root])
        .unwrap();
    assert_eq!(a.matched, vec![PatternId::PrivilegeEscalation]);
    assert_eq!(a.findings[0].bucket, Severity::Critical);
    assert_eq!(a.severity, Severity::Critical);
}

#[test]
fn test_handles_outside_scope() {
    let profile = SubjectProfile {
        allowed_paths: vec![PathBuf::from("/srv/agent")],
        ..SubjectProfile::default()
    };
    let mut o = obs(0);
    o.handles = vec![
        Handle::File {
            path: PathBuf::from("/srv/agent/work.db"),
            writable: true,
        },
        Handle::File {
            path: PathBuf::from("/dev/null"),
            writable: true,
        },
        Handle::File {
            path: PathBuf::from("/etc/shadow"),
            writable: false,
        },
    ];
    let a = classifier().classify(&context(profile), &[o]).unwrap();
    assert_eq!(a.matched, vec![PatternId::PrivilegeEscalation]);
    assert!(a.findings[0].evidence[0].contains("/etc/shadow"));
}

#[test]
fn test_outbound_when_network_not_declared() {
    let profile = SubjectProfile {
        network_allowed: false,
        ..SubjectProfile::default()
    };
    let mut o = obs(0);
    o.handles.push(Handle::Socket {
        remote: Some("203.0.113.9:443".to_string()),
        outbound: true,
    });
    let a = classifier().classify(&context(profile), &[o]).unwrap();
    assert_eq!(a.matched, vec![PatternId::Exfiltration]);
}

#[test]
fn test_unreachable_latest_frame_is_degraded() {
    let frames = vec![
        with_clones(obs(0), 3),
        Observation::unreachable(subject(), 1, obs(1).observed_at, "probe timed out"),
    ];
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &frames)
        .unwrap();
    assert!(a.degraded);
    assert!(a.matched.is_empty());
}

#[test]
fn test_unreachable_frames_do_not_break_streak() {
    let frames = vec![
        with_clones(obs(0), 3),
        Observation::unreachable(subject(), 1, obs(1).observed_at, "probe timed out"),
        with_clones(obs(2), 3),
    ];
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &frames)
        .unwrap();
    assert_eq!(a.findings[0].streak, 2);
}

#[test]
fn test_long_gap_resets_streak() {
    let frames = vec![with_clones(obs(0), 3), obs(1), obs(2), with_clones(obs(3), 3)];
    let a = classifier()
        .classify(&context(SubjectProfile::default()), &frames)
        .unwrap();
    assert_eq!(a.findings[0].streak, 1);
}

#[test]
fn test_classification_is_deterministic() {
    let c = classifier();
    let ctx = context(SubjectProfile::default());
    let mut frames: Vec<Observation> = (0..4).map(|n| with_clones(obs(n), 3)).collect();
    frames[3].resources.effective_uid = Some(0);

    let first = c.classify(&ctx, &frames).unwrap();
    for _ in 0..5 {
        assert_eq!(c.classify(&ctx, &frames).unwrap(), first);
    }
    assert_eq!(first.matched, vec![PatternId::Replication, PatternId::PrivilegeEscalation]);
}
