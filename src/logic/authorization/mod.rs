//! Authorization Gateway - Human approval for destructive actions
//!
//! # Components
//! - `types.rs`: requests, signed responses, decisions
//! - `keys.rs`: operator key registry and signature verification
//! - `channel.rs`: human verification channel (file drop)
//! - `gateway.rs`: submission, waiting, nonce bookkeeping, grants
//! - `audit.rs`: offline provenance check over ledger entries

pub mod audit;
pub mod channel;
pub mod gateway;
pub mod keys;
pub mod types;


pub use audit::{verify_provenance, ProvenanceError, ProvenanceReport};
pub use channel::{ChannelError, ChannelResponse, FileDropChannel, HumanChannel, RequestEnvelope};
pub use gateway::{AuthorizationGrant, Gateway, Resolution};
pub use keys::{KeyRegistryError, OperatorKeyEntry, OperatorRegistry, SignatureVerifier, VerifyError};
pub use types::{
    AuthorizationConfig, AuthorizationRequest, ContainmentAction, Decision, DecisionRecord, DenialReason,
    GatewayError, SignedDecision, Verdict,
};
