//! Human verification channel
//!
//! Delivers requests to an operator surface and collects signed responses.
//! The file-drop channel writes `request_<nonce>.json` into an inbox and
//! picks up `response_<nonce>.json` written by the operator's signing tool.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{AuthorizationRequest, SignedDecision, Verdict};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("channel encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// A response pulled from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelResponse {
    Signed(SignedDecision),
    /// Could not be parsed; the nonce is known only if the envelope gave it away
    Malformed { nonce: Option<u64>, reason: String },
}

pub trait HumanChannel: Send + Sync {
    fn deliver(&self, request: &AuthorizationRequest) -> Result<(), ChannelError>;

    /// Responses that arrived since the last call
    fn collect(&self) -> Result<Vec<ChannelResponse>, ChannelError>;
}

/// What the operator's tool reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request: AuthorizationRequest,
    /// Exact UTF-8 text to sign for approval
    pub approve_message: String,
    /// Exact UTF-8 text to sign for denial
    pub deny_message: String,
}

pub struct FileDropChannel {
    inbox: PathBuf,
}

impl FileDropChannel {
    pub fn new(inbox: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let inbox = inbox.into();
        fs::create_dir_all(inbox.join("processed"))?;
        Ok(Self { inbox })
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    fn archive(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let dest = self.inbox.join("processed").join(name);
        if let Err(e) = fs::rename(path, &dest) {
            log::warn!("Failed to archive response {}: {}", path.display(), e);
            if let Err(e) = fs::remove_file(path) {
                log::error!("Failed to remove response {}; it will be read again: {}", path.display(), e);
            }
        }
    }
}

impl HumanChannel for FileDropChannel {
    fn deliver(&self, request: &AuthorizationRequest) -> Result<(), ChannelError> {
        let envelope = RequestEnvelope {
            request: request.clone(),
            approve_message: String::from_utf8_lossy(&request.signing_message(Verdict::Approve)).to_string(),
            deny_message: String::from_utf8_lossy(&request.signing_message(Verdict::Deny)).to_string(),
        };
        let path = self.inbox.join(format!("request_{}.json", request.nonce));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&envelope)?)?;
        fs::rename(&tmp, &path)?;
        log::info!("Authorization request {} written to {}", request.nonce, path.display());
        Ok(())
    }

    fn collect(&self) -> Result<Vec<ChannelResponse>, ChannelError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.inbox)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("response_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut responses = Vec::with_capacity(paths.len());
        for path in paths {
            let nonce = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("response_"))
                .and_then(|s| s.parse::<u64>().ok());

            let response = match fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str::<SignedDecision>(&text) {
                    Ok(decision) => ChannelResponse::Signed(decision),
                    Err(e) => ChannelResponse::Malformed {
                        nonce,
                        reason: e.to_string(),
                    },
                },
                Err(e) => ChannelResponse::Malformed {
                    nonce,
                    reason: e.to_string(),
                },
            };
            self.archive(&path);
            responses.push(response);
        }
        Ok(responses)
    }
}
