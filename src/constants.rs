//! Central Configuration Constants
//!
//! Single source of truth for all configuration defaults.
//! Paths resolve from environment variables first, then the local data dir.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// App version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name
pub const APP_NAME: &str = "AI-Guardian";

/// Directory under the local data dir that holds all guardian state
pub const DATA_DIR_NAME: &str = "AIGuardian";

/// Configuration file name inside the data dir
pub const CONFIG_FILE: &str = "guardian.json";

/// Audit ledger file name (JSON Lines)
pub const LEDGER_FILE: &str = "guardian_ledger.jsonl";

/// Operator key registry file name
pub const OPERATOR_KEYS_FILE: &str = "operator_keys.json";

/// Operator report snapshot (JSON)
pub const REPORT_FILE: &str = "guardian_report.json";

/// Operator report snapshot (human readable)
pub const REPORT_TEXT_FILE: &str = "guardian_report.txt";

/// Folder for the file-drop human verification channel
pub const AUTHORIZATION_INBOX: &str = "authorization_inbox";

/// Folder for quarantined images
pub const QUARANTINE_FOLDER: &str = "quarantine";

/// Default sampling interval (milliseconds)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Host name stamped on alerts and reports, resolved once
pub static HOSTNAME: Lazy<Option<String>> =
    Lazy::new(|| hostname::get().ok().map(|h| h.to_string_lossy().to_string()));

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Get the guardian data directory from environment or the platform default
pub fn get_data_dir() -> PathBuf {
    std::env::var("GUARDIAN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(DATA_DIR_NAME)
        })
}

/// Get the configuration file path from environment or use default
pub fn get_config_path() -> PathBuf {
    std::env::var("GUARDIAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join(CONFIG_FILE))
}

/// Get the operator key registry path from environment or use default
pub fn get_operator_keys_path() -> PathBuf {
    std::env::var("GUARDIAN_OPERATOR_KEYS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| get_data_dir().join(OPERATOR_KEYS_FILE))
}

/// Get the sampling interval override, if any
pub fn get_poll_interval_override() -> Option<u64> {
    std::env::var("GUARDIAN_POLL_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
}
