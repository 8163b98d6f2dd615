//! Subject profiles
//!
//! What a subject is declared to do. Detectors flag behavior outside it.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectProfile {
    pub role: String,
    /// Path prefixes the subject may hold open. Empty means unrestricted.
    pub allowed_paths: Vec<PathBuf>,
    /// Remote endpoints ("host" or "host:port") it may connect to
    pub allowed_remotes: Vec<String>,
    /// Outbound connections at all
    pub network_allowed: bool,
    /// Subject legitimately rewrites its own image (self-updaters)
    pub self_rewrite_expected: bool,
    /// Bytes the subject may write between two samples
    pub write_budget_bytes: Option<u64>,
}

impl Default for SubjectProfile {
    fn default() -> Self {
        Self {
            role: "agent".to_string(),
            allowed_paths: Vec::new(),
            allowed_remotes: Vec::new(),
            network_allowed: true,
            self_rewrite_expected: false,
            write_budget_bytes: None,
        }
    }
}

impl SubjectProfile {
    pub fn path_allowed(&self, path: &Path) -> bool {
        self.allowed_paths.is_empty() || self.allowed_paths.iter().any(|p| path.starts_with(p))
    }

    pub fn remote_allowed(&self, remote: &str) -> bool {
        if !self.network_allowed {
            return false;
        }
        if self.allowed_remotes.is_empty() {
            return true;
        }
        let host = remote.rsplit_once(':').map(|(h, _)| h).unwrap_or(remote);
        self.allowed_remotes.iter().any(|r| r == remote || r == host)
    }
}

/// Config entry: process name regex to profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRule {
    pub pattern: String,
    pub profile: SubjectProfile,
}

pub struct ProfileSet {
    rules: Vec<(Regex, SubjectProfile)>,
    default: SubjectProfile,
}

impl ProfileSet {
    pub fn compile(rules: &[ProfileRule], default: SubjectProfile) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|r| Regex::new(&r.pattern).map(|re| (re, r.profile.clone())))
            .collect::<Result<_, _>>()?;
        Ok(Self { rules, default })
    }

    /// First rule matching the name wins
    pub fn resolve(&self, name: &str) -> &SubjectProfile {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map(|(_, p)| p)
            .unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_matching() {
        let profile = SubjectProfile {
            allowed_remotes: vec!["api.example.com".to_string(), "10.0.0.5:443".to_string()],
            ..SubjectProfile::default()
        };
        assert!(profile.remote_allowed("api.example.com:443"));
        assert!(profile.remote_allowed("10.0.0.5:443"));
        assert!(!profile.remote_allowed("10.0.0.5:22"));

        let offline = SubjectProfile {
            network_allowed: false,
            ..SubjectProfile::default()
        };
        assert!(!offline.remote_allowed("api.example.com:443"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let updater = SubjectProfile {
            role: "updater".to_string(),
            self_rewrite_expected: true,
            ..SubjectProfile::default()
        };
        let set = ProfileSet::compile(
            &[ProfileRule {
                pattern: "^updater".to_string(),
                profile: updater,
            }],
            SubjectProfile::default(),
        )
        .unwrap();
        assert_eq!(set.resolve("updater-agent").role, "updater");
        assert_eq!(set.resolve("chat-agent").role, "agent");
    }
}
