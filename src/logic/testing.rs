//! Test doubles shared across module tests

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;

use crate::logic::authorization::{
    AuthorizationGrant, AuthorizationRequest, ChannelError, ChannelResponse, Gateway, HumanChannel, OperatorRegistry,
    SignedDecision, Verdict,
};
use crate::logic::classifier::{ObservationRange, Severity, ThreatAssessment};
use crate::logic::lifecycle::{SubjectRecord, SubjectState};
use crate::logic::observer::{
    ChildSpawn, ControlSignal, HostError, HostQuery, ProcessControl, ProcessDescriptor, ProcessProbe, SubjectId,
};

// ============================================================================
// HOST
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub descriptor: ProcessDescriptor,
    pub probe: ProcessProbe,
    pub probe_error: Option<HostError>,
    pub probe_delay: Option<Duration>,
    pub running: bool,
    pub suspended: bool,
    pub ignores_term: bool,
    pub ignores_kill: bool,
    pub denies_signals: bool,
}

/// Scripted process table
#[derive(Default)]
pub struct FakeHost {
    processes: Mutex<BTreeMap<SubjectId, FakeProcess>>,
    queued_spawns: Mutex<HashMap<SubjectId, Vec<ChildSpawn>>>,
    signals: Mutex<Vec<(SubjectId, ControlSignal)>>,
    enumeration_down: AtomicBool,
    enumerate_calls: AtomicU32,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&self, pid: u32, name: &str, exe: Option<&Path>, image_hash: &str) -> SubjectId {
        self.spawn_child(pid, name, exe, image_hash, None)
    }

    pub fn spawn_child(
        &self,
        pid: u32,
        name: &str,
        exe: Option<&Path>,
        image_hash: &str,
        parent: Option<SubjectId>,
    ) -> SubjectId {
        let id = SubjectId::new(pid, 1_000 + pid as u64);
        let mut probe = ProcessProbe::default();
        probe.image_hash = Some(image_hash.to_string());
        probe.resources.effective_uid = Some(1000);
        self.processes.lock().insert(
            id,
            FakeProcess {
                descriptor: ProcessDescriptor {
                    id,
                    name: name.to_string(),
                    exe_path: exe.map(PathBuf::from),
                    parent,
                },
                probe,
                probe_error: None,
                probe_delay: None,
                running: true,
                suspended: false,
                ignores_term: false,
                ignores_kill: false,
                denies_signals: false,
            },
        );
        id
    }

    pub fn update(&self, id: SubjectId, f: impl FnOnce(&mut FakeProcess)) {
        if let Some(process) = self.processes.lock().get_mut(&id) {
            f(process);
        }
    }

    pub fn process(&self, id: SubjectId) -> Option<FakeProcess> {
        self.processes.lock().get(&id).cloned()
    }

    /// Spawns reported once, on the next probe
    pub fn queue_spawns(&self, id: SubjectId, spawns: Vec<ChildSpawn>) {
        self.queued_spawns.lock().entry(id).or_default().extend(spawns);
    }

    pub fn exit(&self, id: SubjectId) {
        self.update(id, |p| p.running = false);
    }

    pub fn set_enumeration_down(&self, down: bool) {
        self.enumeration_down.store(down, Ordering::SeqCst);
    }

    pub fn enumerate_calls(&self) -> u32 {
        self.enumerate_calls.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<(SubjectId, ControlSignal)> {
        self.signals.lock().clone()
    }
}

impl HostQuery for FakeHost {
    fn enumerate(&self) -> Result<Vec<ProcessDescriptor>, HostError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        if self.enumeration_down.load(Ordering::SeqCst) {
            return Err(HostError::Unavailable("process table unreadable".to_string()));
        }
        Ok(self
            .processes
            .lock()
            .values()
            .filter(|p| p.running)
            .map(|p| p.descriptor.clone())
            .collect())
    }

    fn probe(&self, id: &SubjectId) -> Result<ProcessProbe, HostError> {
        let process = self
            .processes
            .lock()
            .get(id)
            .filter(|p| p.running)
            .cloned()
            .ok_or(HostError::NotFound(*id))?;
        if let Some(delay) = process.probe_delay {
            std::thread::sleep(delay);
        }
        if let Some(error) = process.probe_error {
            return Err(error);
        }
        let mut probe = process.probe;
        if let Some(spawns) = self.queued_spawns.lock().remove(id) {
            probe.child_spawns.extend(spawns);
        }
        Ok(probe)
    }

    fn image_hash(&self, id: &SubjectId) -> Result<Option<String>, HostError> {
        self.processes
            .lock()
            .get(id)
            .map(|p| p.probe.image_hash.clone())
            .ok_or(HostError::NotFound(*id))
    }
}

impl ProcessControl for FakeHost {
    fn signal(&self, id: &SubjectId, signal: ControlSignal) -> Result<(), HostError> {
        let mut processes = self.processes.lock();
        let process = processes
            .get_mut(id)
            .filter(|p| p.running)
            .ok_or(HostError::NotFound(*id))?;
        if process.denies_signals {
            return Err(HostError::PermissionDenied(format!("{} to pid {}", signal, id.pid)));
        }
        self.signals.lock().push((*id, signal));
        match signal {
            ControlSignal::Terminate if !process.ignores_term => process.running = false,
            ControlSignal::Kill if !process.ignores_kill => process.running = false,
            ControlSignal::Suspend => process.suspended = true,
            ControlSignal::Resume => process.suspended = false,
            _ => {}
        }
        Ok(())
    }

    fn is_running(&self, id: &SubjectId) -> bool {
        self.processes.lock().get(id).map(|p| p.running).unwrap_or(false)
    }
}

// ============================================================================
// HUMAN CHANNEL
// ============================================================================

#[derive(Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<AuthorizationRequest>>,
    inbox: Mutex<Vec<ChannelResponse>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<AuthorizationRequest> {
        self.delivered.lock().clone()
    }

    pub fn push_response(&self, response: ChannelResponse) {
        self.inbox.lock().push(response);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Wait until a request has been delivered
    pub async fn next_request(&self, already_seen: usize) -> AuthorizationRequest {
        for _ in 0..500 {
            if let Some(request) = self.delivered.lock().get(already_seen).cloned() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no authorization request delivered");
    }
}

impl HumanChannel for RecordingChannel {
    fn deliver(&self, request: &AuthorizationRequest) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("operator console offline".to_string()));
        }
        self.delivered.lock().push(request.clone());
        Ok(())
    }

    fn collect(&self) -> Result<Vec<ChannelResponse>, ChannelError> {
        Ok(std::mem::take(&mut *self.inbox.lock()))
    }
}

// ============================================================================
// OPERATORS
// ============================================================================

pub const OPERATOR: &str = "alice";

pub fn operator_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn registry() -> OperatorRegistry {
    OperatorRegistry::new().with_key(OPERATOR, operator_key().verifying_key())
}

pub fn sign(request: &AuthorizationRequest, verdict: Verdict, key: &SigningKey, operator: &str) -> SignedDecision {
    SignedDecision {
        nonce: request.nonce,
        decision: verdict,
        operator_id: operator.to_string(),
        signature: hex::encode(key.sign(&request.signing_message(verdict)).to_bytes()),
    }
}

/// Run a request through the gateway with a valid operator approval
pub async fn approve(gateway: &Arc<Gateway>, channel: &RecordingChannel, request: AuthorizationRequest) -> AuthorizationGrant {
    let seen = channel.delivered().len();
    let submitter = gateway.clone();
    let pending = tokio::spawn({
        let request = request.clone();
        async move { submitter.submit(request).await }
    });
    channel.next_request(seen).await;
    gateway
        .receive(sign(&request, Verdict::Approve, &operator_key(), OPERATOR))
        .expect("outstanding request");
    pending
        .await
        .expect("submit task")
        .expect("submit")
        .into_grant()
        .expect("approved")
}

// ============================================================================
// BUILDERS
// ============================================================================

pub fn subject_record(id: SubjectId, name: &str, exe: Option<&Path>) -> SubjectRecord {
    SubjectRecord {
        id,
        name: name.to_string(),
        exe_path: exe.map(PathBuf::from),
        image_hash: None,
        lineage: Vec::new(),
        lineage_hashes: Vec::new(),
        first_seen: Utc::now(),
        state: SubjectState::Observed,
    }
}

pub fn assessment(subject: SubjectId, severity: Severity) -> ThreatAssessment {
    ThreatAssessment {
        subject,
        observations: ObservationRange { first: 0, last: 0 },
        matched: Vec::new(),
        findings: Vec::new(),
        severity,
        degraded: false,
        assessed_at: Utc::now(),
    }
}

pub fn request_for(
    nonce: u64,
    record: &SubjectRecord,
    severity: Severity,
    ttl: ChronoDuration,
) -> AuthorizationRequest {
    AuthorizationRequest::new(
        nonce,
        record,
        crate::logic::authorization::ContainmentAction::Quarantine,
        assessment(record.id, severity),
        None,
        ttl,
    )
}
