//! Guardian configuration
//!
//! One JSON file with a section per engine. Every section has defaults, so
//! a missing file or a partial one is fine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants;
use crate::logic::authorization::AuthorizationConfig;
use crate::logic::classifier::ClassifierConfig;
use crate::logic::ledger::LedgerConfig;
use crate::logic::lifecycle::LifecycleConfig;
use crate::logic::observer::ObserverConfig;
use crate::logic::response::ContainmentConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub observer: ObserverConfig,
    pub classifier: ClassifierConfig,
    pub lifecycle: LifecycleConfig,
    pub authorization: AuthorizationConfig,
    pub containment: ContainmentConfig,
    pub ledger: LedgerConfig,
}

impl GuardianConfig {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the configured location and apply environment overrides
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut config = Self::load(&constants::get_config_path())?;
        if let Some(interval) = constants::get_poll_interval_override() {
            config.observer.interval_ms = interval;
        }
        Ok(config)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(|| constants::get_data_dir().join(constants::LEDGER_FILE))
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.containment
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| constants::get_data_dir().join(constants::QUARANTINE_FOLDER))
    }

    pub fn operator_keys_path(&self) -> PathBuf {
        self.authorization
            .operator_keys_path
            .clone()
            .unwrap_or_else(constants::get_operator_keys_path)
    }

    pub fn channel_dir(&self) -> PathBuf {
        self.authorization
            .channel_dir
            .clone()
            .unwrap_or_else(|| constants::get_data_dir().join(constants::AUTHORIZATION_INBOX))
    }

    /// Operator reports are written next to the ledger
    pub fn report_dir(&self) -> PathBuf {
        self.ledger_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(constants::get_data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::classifier::Severity;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardianConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.observer.interval_ms, constants::DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.lifecycle.clear_windows, 5);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.json");
        fs::write(
            &path,
            r#"{
                "observer": { "interval_ms": 1000, "watch_patterns": ["^my-agent$"] },
                "containment": { "terminate_on_critical": true },
                "lifecycle": { "sustain_windows": 2 }
            }"#,
        )
        .unwrap();

        let config = GuardianConfig::load(&path).unwrap();
        assert_eq!(config.observer.interval_ms, 1000);
        assert_eq!(config.observer.watch_patterns, vec!["^my-agent$".to_string()]);
        assert_eq!(config.observer.max_workers, 8);
        assert!(config.containment.terminate_on_critical);
        assert_eq!(config.containment.quarantine_min_severity, Severity::High);
        assert_eq!(config.lifecycle.sustain_windows, 2);
        assert_eq!(config.lifecycle.decay_windows, 2);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.json");
        fs::write(&path, "{ observer: ").unwrap();
        assert!(matches!(GuardianConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
