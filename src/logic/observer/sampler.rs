//! Sampling cycle
//!
//! Enumerate, filter, probe in parallel under a worker cap, sequence,
//! then record every observation in the ledger before handing it on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::host::HostQuery;
use super::types::{
    Discovery, HashDelta, HostError, Observation, ObservationStatus, ObserverConfig, ProcessDescriptor,
    ProcessProbe, SampleReport, SubjectId,
};
use crate::logic::ledger::{AuditEvent, Ledger};

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("invalid watch pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// FILTER
// ============================================================================

/// Decides which processes are watched
pub struct SubjectFilter {
    patterns: Vec<Regex>,
    own_pid: Option<u32>,
}

impl SubjectFilter {
    pub fn new(patterns: &[String], exclude_self: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: patterns.iter().map(|p| Regex::new(p)).collect::<Result<_, _>>()?,
            own_pid: exclude_self.then(std::process::id),
        })
    }

    pub fn matches(&self, descriptor: &ProcessDescriptor) -> bool {
        if Some(descriptor.id.pid) == self.own_pid {
            return false;
        }
        if self.patterns.is_empty() {
            return true;
        }
        let exe = descriptor
            .exe_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        self.patterns
            .iter()
            .any(|re| re.is_match(&descriptor.name) || re.is_match(&exe))
    }
}

// ============================================================================
// OBSERVER
// ============================================================================

struct TrackedSubject {
    next_seq: u64,
    last_hash: Option<String>,
}

enum ProbeOutcome {
    Probed {
        probe: ProcessProbe,
        lineage_hashes: Vec<String>,
    },
    Gone,
    Unreachable(String),
}

pub struct Observer {
    host: Arc<dyn HostQuery>,
    ledger: Arc<Ledger>,
    filter: SubjectFilter,
    config: ObserverConfig,
    tracked: Mutex<HashMap<SubjectId, TrackedSubject>>,
    consecutive_failures: AtomicU32,
}

impl Observer {
    pub fn new(host: Arc<dyn HostQuery>, ledger: Arc<Ledger>, config: ObserverConfig) -> Result<Self, ObserverError> {
        let filter = SubjectFilter::new(&config.watch_patterns, config.exclude_self)?;
        Ok(Self {
            host,
            ledger,
            filter,
            config,
            tracked: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Run one sampling cycle
    pub async fn sample(&self) -> SampleReport {
        let descriptors = match self.enumerate_with_retry().await {
            Ok(list) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                list
            }
            Err((attempts, reason)) => return self.degraded_cycle(attempts, reason),
        };

        let index: HashMap<SubjectId, &ProcessDescriptor> = descriptors.iter().map(|d| (d.id, d)).collect();
        let watched: Vec<&ProcessDescriptor> = descriptors.iter().filter(|d| self.filter.matches(d)).collect();
        let live: HashSet<SubjectId> = watched.iter().map(|d| d.id).collect();

        let mut report = SampleReport::default();
        let new_ids: HashSet<SubjectId> = {
            let mut tracked = self.tracked.lock();
            let exited: Vec<SubjectId> = tracked.keys().filter(|id| !live.contains(id)).copied().collect();
            for id in &exited {
                tracked.remove(id);
            }
            report.exited = exited;
            live.iter().filter(|id| !tracked.contains_key(id)).copied().collect()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let mut tasks = JoinSet::new();

        for descriptor in watched {
            let lineage = if new_ids.contains(&descriptor.id) {
                self.lineage_of(descriptor, &index)
            } else {
                Vec::new()
            };
            let host = self.host.clone();
            let semaphore = semaphore.clone();
            let descriptor = descriptor.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = probe_subject(host, descriptor.id, lineage.clone(), probe_timeout).await;
                (descriptor, lineage, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("Probe task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(d, _, _)| d.id);

        let now = Utc::now();
        let mut sequenced = Vec::with_capacity(outcomes.len());
        {
            let mut tracked = self.tracked.lock();
            for (descriptor, lineage, outcome) in outcomes {
                let id = descriptor.id;
                let is_new = new_ids.contains(&id);

                if matches!(outcome, ProbeOutcome::Gone) {
                    if tracked.remove(&id).is_some() {
                        report.exited.push(id);
                    }
                    continue;
                }

                let entry = tracked.entry(id).or_insert(TrackedSubject {
                    next_seq: 0,
                    last_hash: None,
                });
                let seq = entry.next_seq;
                entry.next_seq += 1;

                let observation = match outcome {
                    ProbeOutcome::Probed { probe, lineage_hashes } => {
                        if is_new {
                            report.discovered.push(Discovery {
                                descriptor,
                                lineage,
                                lineage_hashes,
                            });
                        }
                        let code_hash_delta = match (&entry.last_hash, &probe.image_hash) {
                            (Some(previous), Some(current)) if previous != current => Some(HashDelta {
                                previous: previous.clone(),
                                current: current.clone(),
                            }),
                            _ => None,
                        };
                        if probe.image_hash.is_some() {
                            entry.last_hash = probe.image_hash.clone();
                        }
                        Observation {
                            subject: id,
                            seq,
                            observed_at: now,
                            status: ObservationStatus::Ok,
                            resources: probe.resources,
                            handles: probe.handles,
                            file_activity: probe.file_activity,
                            child_spawns: probe.child_spawns,
                            image_hash: probe.image_hash,
                            code_hash_delta,
                        }
                    }
                    ProbeOutcome::Unreachable(reason) => {
                        if is_new {
                            report.discovered.push(Discovery {
                                descriptor,
                                lineage,
                                lineage_hashes: Vec::new(),
                            });
                        }
                        log::debug!("Subject {} unreachable: {}", id, reason);
                        Observation::unreachable(id, seq, now, reason)
                    }
                    ProbeOutcome::Gone => continue,
                };
                sequenced.push(observation);
            }
        }
        report.exited.sort();

        self.record_all(sequenced, &mut report);
        report
    }

    /// Enumeration failed everywhere: every tracked subject becomes unreachable
    fn degraded_cycle(&self, attempts: u32, reason: String) -> SampleReport {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        log::error!(
            "Process enumeration failed after {} attempts ({} consecutive cycles): {}",
            attempts,
            failures,
            reason
        );
        if let Err(e) = self.ledger.append(&AuditEvent::LivenessFault {
            attempts,
            reason: reason.clone(),
        }) {
            log::error!("Failed to record liveness fault: {}", e);
        }

        let now = Utc::now();
        let sequenced: Vec<Observation> = {
            let mut tracked = self.tracked.lock();
            let mut ids: Vec<SubjectId> = tracked.keys().copied().collect();
            ids.sort();
            ids.into_iter()
                .filter_map(|id| {
                    let entry = tracked.get_mut(&id)?;
                    let seq = entry.next_seq;
                    entry.next_seq += 1;
                    Some(Observation::unreachable(
                        id,
                        seq,
                        now,
                        format!("host enumeration unavailable: {}", reason),
                    ))
                })
                .collect()
        };

        let mut report = SampleReport {
            liveness_fault: Some(reason),
            ..SampleReport::default()
        };
        self.record_all(sequenced, &mut report);
        report
    }

    fn record_all(&self, sequenced: Vec<Observation>, report: &mut SampleReport) {
        for observation in sequenced {
            let event = AuditEvent::ObservationRecorded {
                observation: observation.clone(),
            };
            match self.ledger.append(&event) {
                Ok(_) => report.observations.push(observation),
                Err(e) => {
                    report.dropped += 1;
                    log::error!(
                        "Dropping observation {} of subject {}: ledger rejected it: {}",
                        observation.seq,
                        observation.subject,
                        e
                    );
                }
            }
        }
    }

    async fn enumerate_with_retry(&self) -> Result<Vec<ProcessDescriptor>, (u32, String)> {
        let attempts = self.config.enumerate_retries.max(1);
        let timeout = Duration::from_millis(self.config.enumerate_timeout_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let host = self.host.clone();
            match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || host.enumerate())).await {
                Ok(Ok(Ok(list))) => return Ok(list),
                Ok(Ok(Err(e))) => last_error = e.to_string(),
                Ok(Err(e)) => last_error = format!("enumeration task failed: {}", e),
                Err(_) => last_error = format!("enumeration timed out after {}ms", timeout.as_millis()),
            }
            log::warn!("Process enumeration attempt {}/{} failed: {}", attempt, attempts, last_error);

            if attempt < attempts {
                let backoff = self
                    .config
                    .backoff_base_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16));
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        Err((attempts, last_error))
    }

    /// Ancestors of a process, nearest first
    fn lineage_of(&self, descriptor: &ProcessDescriptor, index: &HashMap<SubjectId, &ProcessDescriptor>) -> Vec<SubjectId> {
        let mut lineage = Vec::new();
        let mut cursor = descriptor.parent;
        while let Some(parent) = cursor {
            if lineage.len() >= self.config.lineage_depth || lineage.contains(&parent) || parent == descriptor.id {
                break;
            }
            lineage.push(parent);
            cursor = index.get(&parent).and_then(|p| p.parent);
        }
        lineage
    }
}

async fn probe_subject(
    host: Arc<dyn HostQuery>,
    id: SubjectId,
    lineage: Vec<SubjectId>,
    timeout: Duration,
) -> ProbeOutcome {
    let task = tokio::task::spawn_blocking(move || {
        let probe = host.probe(&id)?;
        let lineage_hashes = lineage
            .iter()
            .filter_map(|ancestor| host.image_hash(ancestor).ok().flatten())
            .collect();
        Ok::<_, HostError>((probe, lineage_hashes))
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok((probe, lineage_hashes)))) => ProbeOutcome::Probed { probe, lineage_hashes },
        Ok(Ok(Err(HostError::NotFound(_)))) => ProbeOutcome::Gone,
        Ok(Ok(Err(e))) => ProbeOutcome::Unreachable(e.to_string()),
        Ok(Err(e)) => ProbeOutcome::Unreachable(format!("probe task failed: {}", e)),
        Err(_) => ProbeOutcome::Unreachable(format!("probe timed out after {}ms", timeout.as_millis())),
    }
}
