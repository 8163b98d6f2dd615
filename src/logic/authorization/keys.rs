//! Operator key registry
//!
//! Loaded once at start. The only trust root for destructive actions.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("unknown operator {0}")]
    UnknownOperator(String),

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("signature does not verify")]
    Invalid,
}

#[derive(Debug, Error)]
pub enum KeyRegistryError {
    #[error("cannot read key registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid key for operator {operator}: {reason}")]
    InvalidKey { operator: String, reason: String },
}

pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, operator_id: &str, message: &[u8], signature_hex: &str) -> Result<(), VerifyError>;
}

/// On-disk form: `[{"operator_id": "...", "public_key": "<hex>"}]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorKeyEntry {
    pub operator_id: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorRegistry {
    keys: BTreeMap<String, VerifyingKey>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, operator_id: impl Into<String>, key: VerifyingKey) -> Self {
        self.keys.insert(operator_id.into(), key);
        self
    }

    pub fn from_entries(entries: &[OperatorKeyEntry]) -> Result<Self, KeyRegistryError> {
        let mut keys = BTreeMap::new();
        for entry in entries {
            let invalid = |reason: String| KeyRegistryError::InvalidKey {
                operator: entry.operator_id.clone(),
                reason,
            };
            let bytes = hex::decode(entry.public_key.trim()).map_err(|e| invalid(e.to_string()))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| invalid(format!("expected 32 bytes, got {}", b.len())))?;
            let key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
            keys.insert(entry.operator_id.clone(), key);
        }
        Ok(Self { keys })
    }

    pub fn load(path: &Path) -> Result<Self, KeyRegistryError> {
        let text = fs::read_to_string(path).map_err(|source| KeyRegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<OperatorKeyEntry> = serde_json::from_str(&text)?;
        let registry = Self::from_entries(&entries)?;
        log::info!("Loaded {} operator key(s) from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn operators(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }
}

impl SignatureVerifier for OperatorRegistry {
    fn verify(&self, operator_id: &str, message: &[u8], signature_hex: &str) -> Result<(), VerifyError> {
        let key = self
            .keys
            .get(operator_id)
            .ok_or_else(|| VerifyError::UnknownOperator(operator_id.to_string()))?;
        let bytes = hex::decode(signature_hex.trim()).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let signature = Signature::from_slice(&bytes).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        key.verify_strict(message, &signature).map_err(|_| VerifyError::Invalid)
    }
}
