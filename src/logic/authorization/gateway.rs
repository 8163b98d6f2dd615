//! Authorization Gateway
//!
//! The only path from an escalation to a destructive action. A request
//! waits as a suspended future until a signed response for its nonce
//! arrives or the expiry deadline passes. Each nonce resolves once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::channel::{ChannelResponse, HumanChannel};
use super::keys::{SignatureVerifier, VerifyError};
use super::types::{
    AuthorizationConfig, AuthorizationRequest, Decision, DecisionRecord, DenialReason, GatewayError,
    SignedDecision, Verdict,
};
use crate::logic::ledger::{AuditEvent, Ledger};

// ============================================================================
// GRANT
// ============================================================================

/// Proof of an approved, durably recorded authorization.
/// Only the gateway can construct one.
#[derive(Debug)]
pub struct AuthorizationGrant {
    request: AuthorizationRequest,
    operator_id: String,
    signature: String,
    approval_seq: u64,
    approved_at: DateTime<Utc>,
}

impl AuthorizationGrant {
    pub fn request(&self) -> &AuthorizationRequest {
        &self.request
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Ledger seq of the approval entry
    pub fn approval_seq(&self) -> u64 {
        self.approval_seq
    }

    pub fn approved_at(&self) -> DateTime<Utc> {
        self.approved_at
    }
}

#[derive(Debug)]
pub struct Resolution {
    record: DecisionRecord,
    ledger_seq: Option<u64>,
    grant: Option<AuthorizationGrant>,
}

impl Resolution {
    pub fn decision(&self) -> Decision {
        self.record.decision
    }

    pub fn nonce(&self) -> u64 {
        self.record.nonce
    }

    pub fn record(&self) -> &DecisionRecord {
        &self.record
    }

    pub fn ledger_seq(&self) -> Option<u64> {
        self.ledger_seq
    }

    pub fn into_grant(self) -> Option<AuthorizationGrant> {
        self.grant
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

struct Outstanding {
    request: AuthorizationRequest,
    resolve: oneshot::Sender<Resolution>,
}

pub struct Gateway {
    verifier: Arc<dyn SignatureVerifier>,
    channel: Arc<dyn HumanChannel>,
    ledger: Arc<Ledger>,
    config: AuthorizationConfig,
    next_nonce: AtomicU64,
    outstanding: Mutex<HashMap<u64, Outstanding>>,
    submitted: Mutex<HashSet<u64>>,
}

impl Gateway {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        channel: Arc<dyn HumanChannel>,
        ledger: Arc<Ledger>,
        config: AuthorizationConfig,
    ) -> Self {
        // Nonces from earlier runs are never reused
        let previous: HashSet<u64> = ledger
            .events_of_kind("authorization_submitted")
            .into_iter()
            .filter_map(|(_, event)| match event {
                AuditEvent::AuthorizationSubmitted { request } => Some(request.nonce),
                _ => None,
            })
            .collect();
        let next_nonce = previous.iter().max().map(|n| n + 1).unwrap_or(1);
        if !previous.is_empty() {
            log::info!(
                "Gateway resuming after {} recorded request(s), next nonce {}",
                previous.len(),
                next_nonce
            );
        }

        Self {
            verifier,
            channel,
            ledger,
            config,
            next_nonce: AtomicU64::new(next_nonce),
            outstanding: Mutex::new(HashMap::new()),
            submitted: Mutex::new(previous),
        }
    }

    pub fn issue_nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::SeqCst)
    }

    pub fn request_ttl(&self) -> chrono::Duration {
        self.config.request_ttl()
    }

    pub fn outstanding(&self) -> Vec<AuthorizationRequest> {
        let mut requests: Vec<AuthorizationRequest> =
            self.outstanding.lock().values().map(|o| o.request.clone()).collect();
        requests.sort_by_key(|r| r.nonce);
        requests
    }

    /// Surface a request and wait for its decision
    pub async fn submit(&self, request: AuthorizationRequest) -> Result<Resolution, GatewayError> {
        let nonce = request.nonce;
        if nonce == 0 || nonce >= self.next_nonce.load(Ordering::SeqCst) {
            return Err(GatewayError::NotIssued(nonce));
        }
        if request.is_expired_at(Utc::now()) {
            return Err(GatewayError::AlreadyExpired(nonce));
        }
        if !self.submitted.lock().insert(nonce) {
            return Err(GatewayError::AlreadySubmitted(nonce));
        }

        let submitted = AuditEvent::AuthorizationSubmitted {
            request: request.clone(),
        };
        if let Err(e) = self.ledger.append_durable(&submitted) {
            self.submitted.lock().remove(&nonce);
            return Err(e.into());
        }

        let (tx, mut rx) = oneshot::channel();
        let expires_at = request.expires_at;
        self.outstanding.lock().insert(
            nonce,
            Outstanding {
                request: request.clone(),
                resolve: tx,
            },
        );
        log::warn!(
            "Authorization requested: {} subject {} ({}), nonce {}, expires {}",
            request.action,
            request.subject,
            request.subject_name,
            nonce,
            expires_at
        );

        if let Err(e) = self.channel.deliver(&request) {
            log::error!("Failed to deliver authorization request {}: {}", nonce, e);
            if let Some(outstanding) = self.take(nonce) {
                return Ok(self.resolve(
                    outstanding.request,
                    Decision::Denied,
                    Some(DenialReason::ChannelUnavailable),
                    None,
                ));
            }
        }

        let remaining = (expires_at - Utc::now()).to_std().unwrap_or_default();
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);

        let received = tokio::select! {
            result = &mut rx => Some(result),
            _ = &mut deadline => None,
        };

        match received {
            Some(result) => result.map_err(|_| GatewayError::Abandoned(nonce)),
            None => match self.take(nonce) {
                Some(outstanding) => {
                    log::warn!("Authorization request {} expired without a response", nonce);
                    Ok(self.resolve(outstanding.request, Decision::Expired, None, None))
                }
                // A response claimed the nonce while the timer fired
                None => rx.await.map_err(|_| GatewayError::Abandoned(nonce)),
            },
        }
    }

    /// Accept a signed response from the channel
    pub fn receive(&self, response: SignedDecision) -> Result<Decision, GatewayError> {
        let nonce = response.nonce;
        let Some(outstanding) = self.take(nonce) else {
            let replayed = self.submitted.lock().contains(&nonce);
            let reason = if replayed {
                "nonce already resolved"
            } else {
                "no outstanding request for nonce"
            };
            log::warn!("Rejected authorization response for nonce {}: {}", nonce, reason);
            self.record_rejection(nonce, reason, Some(&response));
            return Err(if replayed {
                GatewayError::Replayed(nonce)
            } else {
                GatewayError::UnknownNonce(nonce)
            });
        };

        let Outstanding { request, resolve } = outstanding;
        let resolution = self.adjudicate(request, &response);
        Ok(Self::hand_back(resolve, resolution))
    }

    /// A response that could not be parsed counts as denial of its request
    pub fn reject_malformed(&self, nonce: Option<u64>, reason: &str) -> Option<Decision> {
        let outstanding = nonce.and_then(|n| self.take(n));
        match outstanding {
            Some(Outstanding { request, resolve }) => {
                log::warn!("Malformed response for nonce {}: {}", request.nonce, reason);
                let resolution = self.resolve(request, Decision::Denied, Some(DenialReason::MalformedResponse), None);
                Some(Self::hand_back(resolve, resolution))
            }
            None => {
                self.record_rejection(nonce.unwrap_or(0), reason, None);
                None
            }
        }
    }

    /// Close a request whose subject is gone. A request not yet submitted
    /// is barred from being submitted later.
    pub fn withdraw(&self, nonce: u64) -> Option<Decision> {
        match self.take(nonce) {
            Some(Outstanding { request, resolve }) => {
                log::info!("Authorization request {} withdrawn: subject {} exited", nonce, request.subject);
                let resolution = self.resolve(request, Decision::Denied, Some(DenialReason::SubjectExited), None);
                Some(Self::hand_back(resolve, resolution))
            }
            None => {
                self.submitted.lock().insert(nonce);
                None
            }
        }
    }

    /// Drain the channel once; returns how many responses were handled
    pub fn poll_channel(&self) -> usize {
        let responses = match self.channel.collect() {
            Ok(responses) => responses,
            Err(e) => {
                log::warn!("Failed to read authorization channel: {}", e);
                return 0;
            }
        };
        let count = responses.len();
        for response in responses {
            match response {
                ChannelResponse::Signed(decision) => {
                    if let Err(e) = self.receive(decision) {
                        log::debug!("Channel response ignored: {}", e);
                    }
                }
                ChannelResponse::Malformed { nonce, reason } => {
                    self.reject_malformed(nonce, &reason);
                }
            }
        }
        count
    }

    fn take(&self, nonce: u64) -> Option<Outstanding> {
        self.outstanding.lock().remove(&nonce)
    }

    fn adjudicate(&self, request: AuthorizationRequest, response: &SignedDecision) -> Resolution {
        if request.is_expired_at(Utc::now()) {
            log::warn!("Response for nonce {} arrived after expiry", request.nonce);
            return self.resolve(request, Decision::Expired, None, Some(response));
        }

        let message = request.signing_message(response.decision);
        match self
            .verifier
            .verify(&response.operator_id, &message, &response.signature)
        {
            Ok(()) => match response.decision {
                Verdict::Approve => self.resolve(request, Decision::Approved, None, Some(response)),
                Verdict::Deny => self.resolve(request, Decision::Denied, Some(DenialReason::Operator), Some(response)),
            },
            Err(e) => {
                log::warn!("Signature check failed for nonce {}: {}", request.nonce, e);
                let reason = match e {
                    VerifyError::UnknownOperator(_) => DenialReason::UnknownOperator,
                    VerifyError::Malformed(_) => DenialReason::MalformedResponse,
                    VerifyError::Invalid => DenialReason::InvalidSignature,
                };
                self.resolve(request, Decision::Denied, Some(reason), Some(response))
            }
        }
    }

    /// Record the decision. An approval that cannot be recorded durably
    /// becomes a denial.
    fn resolve(
        &self,
        request: AuthorizationRequest,
        decision: Decision,
        reason: Option<DenialReason>,
        response: Option<&SignedDecision>,
    ) -> Resolution {
        let mut record = DecisionRecord {
            request_id: request.request_id,
            nonce: request.nonce,
            subject: request.subject,
            action: request.action,
            decision,
            reason,
            operator_id: response.map(|r| r.operator_id.clone()),
            signature: response.map(|r| r.signature.clone()),
            decided_at: Utc::now(),
        };

        if decision == Decision::Approved {
            let event = AuditEvent::AuthorizationDecided { record: record.clone() };
            match self.ledger.append_durable(&event) {
                Ok(seq) => {
                    log::warn!(
                        "Authorization {} approved by {} for {} of {}",
                        record.nonce,
                        record.operator_id.as_deref().unwrap_or("?"),
                        request.action,
                        request.subject
                    );
                    let grant = AuthorizationGrant {
                        operator_id: record.operator_id.clone().unwrap_or_default(),
                        signature: record.signature.clone().unwrap_or_default(),
                        approval_seq: seq,
                        approved_at: record.decided_at,
                        request,
                    };
                    return Resolution {
                        record,
                        ledger_seq: Some(seq),
                        grant: Some(grant),
                    };
                }
                Err(e) => {
                    log::error!(
                        "Approval for nonce {} could not be recorded durably, denying: {}",
                        record.nonce,
                        e
                    );
                    record.decision = Decision::Denied;
                    record.reason = Some(DenialReason::LedgerUnavailable);
                }
            }
        } else {
            log::info!("Authorization {} resolved as {}", record.nonce, record.decision);
        }

        let ledger_seq = match self.ledger.append(&AuditEvent::AuthorizationDecided { record: record.clone() }) {
            Ok(seq) => Some(seq),
            Err(e) => {
                log::error!("Failed to record decision for nonce {}: {}", record.nonce, e);
                None
            }
        };
        Resolution {
            record,
            ledger_seq,
            grant: None,
        }
    }

    fn record_rejection(&self, nonce: u64, reason: &str, response: Option<&SignedDecision>) {
        let event = AuditEvent::AuthorizationResponseRejected {
            nonce,
            reason: reason.to_string(),
            operator_id: response.map(|r| r.operator_id.clone()),
            signature: response.map(|r| r.signature.clone()),
        };
        if let Err(e) = self.ledger.append(&event) {
            log::error!("Failed to record rejected response for nonce {}: {}", nonce, e);
        }
    }

    fn hand_back(resolve: oneshot::Sender<Resolution>, resolution: Resolution) -> Decision {
        let decision = resolution.decision();
        let nonce = resolution.nonce();
        if resolve.send(resolution).is_err() {
            log::warn!("Submitter for nonce {} is gone; {} recorded only", nonce, decision);
        }
        decision
    }
}
