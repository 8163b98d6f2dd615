//! Guardian engine
//!
//! Each sampling cycle hands observations to per-subject tasks. A subject's
//! task processes its messages one at a time, so its classification and
//! transitions stay in order while different subjects run in parallel.
//! Authorization waits and containment run off the subject task and report
//! back through the same queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::board::SubjectBoard;
use super::tracker::SubjectTracker;
use super::types::{CycleSummary, EngineError};
use crate::logic::alerts::{Alert, AlertBoard, AlertKind, AlertLevel};
use crate::logic::authorization::{AuthorizationGrant, AuthorizationRequest, Gateway, HumanChannel, Resolution, SignatureVerifier};
use crate::logic::classifier::{Classifier, ProfileSet};
use crate::logic::config::GuardianConfig;
use crate::logic::ledger::{AuditEvent, Ledger};
use crate::logic::lifecycle::{LifecycleConfig, SubjectRecord};
use crate::logic::observer::{Discovery, HostQuery, Observation, Observer, ProcessControl, SubjectId};
use crate::logic::response::{ActionRecord, ContainmentError, ContainmentExecutor, QuarantineVault};

/// Components shared by every subject task
pub struct Services {
    pub ledger: Arc<Ledger>,
    pub classifier: Classifier,
    pub profiles: ProfileSet,
    pub gateway: Arc<Gateway>,
    pub executor: Arc<ContainmentExecutor>,
    pub alerts: AlertBoard,
    pub board: SubjectBoard,
    pub lifecycle: LifecycleConfig,
    pub window_len: usize,
}

enum SubjectMsg {
    Observation(Observation, oneshot::Sender<()>),
    Resolution(Resolution),
    SubmissionFailed { nonce: u64, reason: String },
    Contained(Result<ActionRecord, ContainmentError>),
    Exited(oneshot::Sender<()>),
}

type SubjectQueue = mpsc::UnboundedSender<SubjectMsg>;

pub struct Guardian {
    observer: Observer,
    services: Arc<Services>,
    subjects: Mutex<HashMap<SubjectId, SubjectQueue>>,
    interval: Duration,
    channel_poll: Duration,
    ledger_degraded: AtomicBool,
}

impl Guardian {
    pub fn from_config<H>(
        config: &GuardianConfig,
        host: Arc<H>,
        verifier: Arc<dyn SignatureVerifier>,
        channel: Arc<dyn HumanChannel>,
        ledger: Arc<Ledger>,
    ) -> Result<Self, EngineError>
    where
        H: HostQuery + ProcessControl + 'static,
    {
        let observer = Observer::new(host.clone(), ledger.clone(), config.observer.clone())?;
        let classifier = Classifier::new(&config.classifier)?;
        let profiles = ProfileSet::compile(&config.classifier.profiles, config.classifier.default_profile.clone())?;
        let gateway = Arc::new(Gateway::new(verifier, channel, ledger.clone(), config.authorization.clone()));
        let vault = QuarantineVault::open(config.quarantine_dir())?;
        let executor = Arc::new(ContainmentExecutor::new(
            host,
            vault,
            ledger.clone(),
            config.containment.clone(),
        ));

        let services = Services {
            alerts: AlertBoard::new(ledger.clone()),
            ledger,
            classifier,
            profiles,
            gateway,
            executor,
            board: SubjectBoard::new(),
            lifecycle: config.lifecycle.clone(),
            window_len: config.classifier.window_len,
        };

        Ok(Self {
            observer,
            services: Arc::new(services),
            subjects: Mutex::new(HashMap::new()),
            interval: Duration::from_millis(config.observer.interval_ms.max(1)),
            channel_poll: Duration::from_millis(config.authorization.poll_interval_ms.max(1)),
            ledger_degraded: AtomicBool::new(false),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// One sampling cycle. Returns once every subject has processed its
    /// observation or the cycle deadline passes.
    pub async fn run_cycle(&self) -> CycleSummary {
        let report = self.observer.sample().await;
        let deadline = Instant::now() + self.interval;

        if let Some(reason) = &report.liveness_fault {
            self.services.alerts.raise(Alert::new(
                AlertKind::LivenessFault,
                AlertLevel::High,
                "Process table unreadable",
                format!(
                    "{} ({} consecutive cycles); tracked subjects marked unreachable",
                    reason,
                    self.observer.consecutive_failures()
                ),
            ));
        }

        for discovery in &report.discovered {
            self.admit(discovery);
        }

        let mut acks = Vec::with_capacity(report.observations.len() + report.exited.len());
        for observation in report.observations.iter().cloned() {
            let subject = observation.subject;
            let (tx, rx) = oneshot::channel();
            if self.send(&subject, SubjectMsg::Observation(observation, tx)) {
                acks.push(rx);
            }
        }
        for subject in &report.exited {
            let (tx, rx) = oneshot::channel();
            if self.send(subject, SubjectMsg::Exited(tx)) {
                acks.push(rx);
            }
            self.subjects.lock().remove(subject);
        }

        let mut unacknowledged = 0;
        for ack in acks {
            if tokio::time::timeout_at(deadline, ack).await.is_err() {
                unacknowledged += 1;
            }
        }
        if unacknowledged > 0 {
            log::warn!("{} subject(s) still busy at the end of the cycle", unacknowledged);
        }

        let ledger_durable = self.check_ledger();
        CycleSummary {
            discovered: report.discovered.len(),
            observed: report.observations.len(),
            exited: report.exited.len(),
            dropped: report.dropped,
            liveness_fault: report.liveness_fault,
            unacknowledged,
            tracked: self.subjects.lock().len(),
            ledger_durable,
        }
    }

    /// Sample on the configured interval and pump the authorization channel
    /// until `shutdown` resolves
    pub async fn run<S, C>(&self, shutdown: S, mut after_cycle: C)
    where
        S: Future<Output = ()>,
        C: FnMut(&Guardian, &CycleSummary),
    {
        let mut sample_tick = tokio::time::interval(self.interval);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut channel_tick = tokio::time::interval(self.channel_poll);
        channel_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        log::info!(
            "Guardian loop started (interval {}ms, channel poll {}ms)",
            self.interval.as_millis(),
            self.channel_poll.as_millis()
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sample_tick.tick() => {
                    let summary = self.run_cycle().await;
                    log::debug!(
                        "Cycle: {} observed, {} discovered, {} exited, {} tracked",
                        summary.observed,
                        summary.discovered,
                        summary.exited,
                        summary.tracked
                    );
                    after_cycle(self, &summary);
                }
                _ = channel_tick.tick() => {
                    self.services.gateway.poll_channel();
                }
            }
        }

        log::info!("Guardian loop stopped");
        if let Err(e) = self.services.ledger.flush() {
            log::error!("Ledger not fully flushed at shutdown: {}", e);
        }
    }

    fn admit(&self, discovery: &Discovery) {
        let record = SubjectRecord::from_discovery(discovery, Utc::now());
        if let Err(e) = self.services.ledger.append(&AuditEvent::SubjectDiscovered {
            subject: record.clone(),
        }) {
            log::error!("Failed to record discovery of {}: {}", record.id, e);
        }
        log::info!(
            "Watching {} ({}) lineage depth {}",
            record.name,
            record.id,
            record.lineage.len()
        );

        let profile = self.services.profiles.resolve(&record.name).clone();
        let tracker = SubjectTracker::new(record, profile, self.services.lifecycle.clone());
        self.services.board.update(tracker.snapshot());

        let (tx, rx) = mpsc::unbounded_channel();
        let id = tracker.id();
        tokio::spawn(run_subject(tracker, rx, tx.downgrade(), self.services.clone()));
        self.subjects.lock().insert(id, tx);
    }

    fn send(&self, subject: &SubjectId, msg: SubjectMsg) -> bool {
        let mut subjects = self.subjects.lock();
        match subjects.get(subject) {
            Some(queue) if queue.send(msg).is_ok() => true,
            Some(_) => {
                subjects.remove(subject);
                false
            }
            None => false,
        }
    }

    fn check_ledger(&self) -> bool {
        let durable = self.services.ledger.is_durable();
        let was_degraded = self.ledger_degraded.swap(!durable, Ordering::SeqCst);
        if !durable && !was_degraded {
            let status = self.services.ledger.status();
            self.services.alerts.raise(Alert::new(
                AlertKind::LedgerDegraded,
                AlertLevel::Critical,
                "Ledger storage unavailable",
                format!(
                    "{} entries buffered for {}; new escalations are held",
                    status.pending, status.location
                ),
            ));
        } else if durable && was_degraded {
            log::info!("Ledger storage durable again");
        }
        durable
    }
}

// ============================================================================
// SUBJECT TASK
// ============================================================================

async fn run_subject(
    mut tracker: SubjectTracker,
    mut inbox: mpsc::UnboundedReceiver<SubjectMsg>,
    queue: mpsc::WeakUnboundedSender<SubjectMsg>,
    svc: Arc<Services>,
) {
    while let Some(msg) = inbox.recv().await {
        match msg {
            SubjectMsg::Observation(observation, ack) => {
                if let Some(request) = tracker.on_observation(observation, &svc) {
                    spawn_submission(request, queue.clone(), svc.clone());
                }
                svc.board.update(tracker.snapshot());
                let _ = ack.send(());
            }
            SubjectMsg::Resolution(resolution) => {
                if let Some(grant) = tracker.on_resolution(resolution, &svc) {
                    spawn_containment(grant, queue.clone(), svc.clone());
                }
                svc.board.update(tracker.snapshot());
            }
            SubjectMsg::SubmissionFailed { nonce, reason } => {
                tracker.on_submission_failed(nonce, &reason, &svc);
                svc.board.update(tracker.snapshot());
            }
            SubjectMsg::Contained(result) => {
                tracker.on_containment(result, &svc);
                svc.board.update(tracker.snapshot());
            }
            SubjectMsg::Exited(ack) => {
                tracker.on_exit(&svc);
                let _ = ack.send(());
            }
        }

        if tracker.state().is_terminal() {
            break;
        }
    }

    let snapshot = tracker.snapshot();
    if let Err(e) = svc.ledger.append(&AuditEvent::SubjectArchived {
        subject: snapshot.record.id,
        final_state: snapshot.state,
    }) {
        log::error!("Failed to record archive of {}: {}", snapshot.record.id, e);
    }
    log::info!("Subject {} archived in {}", snapshot.record.id, snapshot.state);
    svc.board.archive(snapshot);
}

/// Wait for the operator off the subject task
fn spawn_submission(request: AuthorizationRequest, queue: mpsc::WeakUnboundedSender<SubjectMsg>, svc: Arc<Services>) {
    tokio::spawn(async move {
        let nonce = request.nonce;
        let msg = match svc.gateway.submit(request).await {
            Ok(resolution) => SubjectMsg::Resolution(resolution),
            Err(e) => {
                log::error!("Authorization request {} could not be submitted: {}", nonce, e);
                SubjectMsg::SubmissionFailed {
                    nonce,
                    reason: e.to_string(),
                }
            }
        };
        deliver(&queue, msg);
    });
}

fn spawn_containment(grant: AuthorizationGrant, queue: mpsc::WeakUnboundedSender<SubjectMsg>, svc: Arc<Services>) {
    tokio::spawn(async move {
        let executor = svc.executor.clone();
        let nonce = grant.request().nonce;
        let result = match tokio::task::spawn_blocking(move || executor.execute(grant)).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Containment task for nonce {} failed: {}", nonce, e);
                Err(ContainmentError::Signal(format!("containment task failed: {}", e)))
            }
        };
        deliver(&queue, SubjectMsg::Contained(result));
    });
}

fn deliver(queue: &mpsc::WeakUnboundedSender<SubjectMsg>, msg: SubjectMsg) {
    match queue.upgrade() {
        Some(queue) => {
            if queue.send(msg).is_err() {
                log::warn!("Subject task gone before result could be delivered");
            }
        }
        None => log::warn!("Subject task gone before result could be delivered"),
    }
}
