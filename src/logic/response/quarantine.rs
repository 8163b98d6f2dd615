//! Quarantine vault
//!
//! Moves a subject's executable image into a locked-down directory and
//! keeps enough metadata beside it to put the file back.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::types::{ContainmentError, QuarantineEntry};
use crate::logic::observer::{calculate_file_hash, SubjectId};

const QUARANTINED_EXT: &str = "quarantine";
const SIDECAR_EXT: &str = "json";

pub struct QuarantineVault {
    dir: PathBuf,
    entries: RwLock<HashMap<String, QuarantineEntry>>,
}

impl QuarantineVault {
    /// Open (or create) the vault and reload entries left by earlier runs
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ContainmentError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        set_mode(&dir, 0o700)?;

        let mut entries = HashMap::new();
        for item in fs::read_dir(&dir)?.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXT) {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<QuarantineEntry>(&text).ok());
            match parsed {
                Some(entry) if entry.quarantine_path.exists() => {
                    entries.insert(entry.id.clone(), entry);
                }
                _ => log::warn!("Ignoring stale quarantine metadata {}", path.display()),
            }
        }
        if !entries.is_empty() {
            log::info!("Quarantine vault {} holds {} file(s)", dir.display(), entries.len());
        }

        Ok(Self {
            dir,
            entries: RwLock::new(entries),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quarantine(&self, path: &Path, subject: SubjectId, nonce: u64) -> Result<QuarantineEntry, ContainmentError> {
        if !path.is_file() {
            return Err(ContainmentError::FileNotFound(path.to_path_buf()));
        }
        let metadata = fs::metadata(path)?;
        let sha256 = calculate_file_hash(path)?;
        let id = Uuid::new_v4().to_string();
        let quarantine_path = self.dir.join(format!("{}.{}", id, QUARANTINED_EXT));

        move_file(path, &quarantine_path)?;

        let entry = QuarantineEntry {
            id: id.clone(),
            subject,
            nonce,
            original_path: path.to_path_buf(),
            quarantine_path: quarantine_path.clone(),
            file_size: metadata.len(),
            sha256,
            original_mode: mode_of(&metadata),
            quarantined_at: Utc::now(),
            can_restore: true,
        };
        if let Err(e) = self.seal(&entry) {
            log::error!("Failed to seal {}, moving it back: {}", quarantine_path.display(), e);
            self.roll_back(&entry);
            return Err(e.into());
        }
        self.entries.write().insert(id, entry.clone());

        log::warn!("Quarantined {} -> {}", path.display(), quarantine_path.display());
        Ok(entry)
    }

    /// Move the file back. If something now occupies the original path the
    /// file lands beside it with a `_restored` suffix.
    pub fn restore(&self, entry: &QuarantineEntry) -> Result<PathBuf, ContainmentError> {
        if !entry.quarantine_path.exists() {
            return Err(ContainmentError::FileNotFound(entry.quarantine_path.clone()));
        }

        let target = if entry.original_path.exists() {
            restored_name(&entry.original_path)
        } else {
            entry.original_path.clone()
        };

        set_mode(&entry.quarantine_path, 0o600)?;
        move_file(&entry.quarantine_path, &target)?;
        if let Some(mode) = entry.original_mode {
            set_mode(&target, mode)?;
        }

        if let Err(e) = fs::remove_file(self.sidecar(&entry.id)) {
            log::warn!("Failed to remove quarantine metadata for {}: {}", entry.id, e);
        }
        self.entries.write().remove(&entry.id);

        log::info!("Restored {} -> {}", entry.quarantine_path.display(), target.display());
        Ok(target)
    }

    pub fn list(&self) -> Vec<QuarantineEntry> {
        let mut entries: Vec<QuarantineEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by_key(|e| e.quarantined_at);
        entries
    }

    pub fn get(&self, id: &str) -> Option<QuarantineEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Lock the moved file down and write its metadata beside it
    fn seal(&self, entry: &QuarantineEntry) -> std::io::Result<()> {
        set_mode(&entry.quarantine_path, 0o400)?;
        fs::write(
            self.sidecar(&entry.id),
            serde_json::to_vec_pretty(entry).map_err(std::io::Error::from)?,
        )
    }

    /// Put an image back after the vault failed to take it
    fn roll_back(&self, entry: &QuarantineEntry) {
        match move_file(&entry.quarantine_path, &entry.original_path) {
            Ok(()) => {
                if let Some(mode) = entry.original_mode {
                    if let Err(e) = set_mode(&entry.original_path, mode) {
                        log::warn!("Failed to reset mode of {}: {}", entry.original_path.display(), e);
                    }
                }
            }
            Err(e) => log::error!(
                "Failed to move {} back to {}: {}",
                entry.quarantine_path.display(),
                entry.original_path.display(),
                e
            ),
        }

        let sidecar = self.sidecar(&entry.id);
        if sidecar.exists() {
            if let Err(e) = fs::remove_file(&sidecar) {
                log::warn!("Failed to remove {}: {}", sidecar.display(), e);
            }
        }
    }

    fn sidecar(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SIDECAR_EXT))
    }
}

/// Rename, falling back to copy + remove across devices
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::rename(from, to).or_else(|_| fs::copy(from, to).and_then(|_| fs::remove_file(from)))
}

fn restored_name(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let ext = original
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    original.with_file_name(format!("{}_restored{}", stem, ext))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_quarantine_and_restore() {
        let work = tempfile::tempdir().unwrap();
        let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
        let exe = image(work.path(), "agent.bin", b"payload");
        let subject = SubjectId::new(11, 22);

        let entry = vault.quarantine(&exe, subject, 5).unwrap();
        assert!(!exe.exists());
        assert!(entry.quarantine_path.exists());
        assert_eq!(entry.file_size, 7);
        assert_eq!(entry.sha256, calculate_file_hash(&entry.quarantine_path).unwrap());
        assert_eq!(vault.list().len(), 1);

        let restored = vault.restore(&entry).unwrap();
        assert_eq!(restored, exe);
        assert_eq!(fs::read(&exe).unwrap(), b"payload");
        assert!(vault.list().is_empty());
    }

    #[test]
    fn test_restore_beside_replacement() {
        let work = tempfile::tempdir().unwrap();
        let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
        let exe = image(work.path(), "agent.bin", b"old");
        let entry = vault.quarantine(&exe, SubjectId::new(1, 1), 1).unwrap();

        image(work.path(), "agent.bin", b"new");
        let restored = vault.restore(&entry).unwrap();
        assert_eq!(restored, work.path().join("agent_restored.bin"));
        assert_eq!(fs::read(&exe).unwrap(), b"new");
    }

    #[test]
    fn test_entries_survive_reopen() {
        let work = tempfile::tempdir().unwrap();
        let exe = image(work.path(), "agent", b"x");
        let id = {
            let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
            vault.quarantine(&exe, SubjectId::new(3, 4), 2).unwrap().id
        };
        let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
        let entry = vault.get(&id).unwrap();
        assert_eq!(entry.nonce, 2);
        assert!(vault.restore(&entry).is_ok());
    }

    #[test]
    fn test_roll_back_returns_image() {
        let work = tempfile::tempdir().unwrap();
        let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
        let exe = image(work.path(), "agent", b"payload");
        let metadata = fs::metadata(&exe).unwrap();

        let id = Uuid::new_v4().to_string();
        let entry = QuarantineEntry {
            id: id.clone(),
            subject: SubjectId::new(9, 9),
            nonce: 4,
            original_path: exe.clone(),
            quarantine_path: vault.dir().join(format!("{}.{}", id, QUARANTINED_EXT)),
            file_size: metadata.len(),
            sha256: calculate_file_hash(&exe).unwrap(),
            original_mode: mode_of(&metadata),
            quarantined_at: Utc::now(),
            can_restore: true,
        };
        move_file(&exe, &entry.quarantine_path).unwrap();
        vault.seal(&entry).unwrap();

        vault.roll_back(&entry);
        assert_eq!(fs::read(&exe).unwrap(), b"payload");
        assert!(!entry.quarantine_path.exists());
        assert!(!vault.sidecar(&id).exists());
        assert_eq!(mode_of(&fs::metadata(&exe).unwrap()), mode_of(&metadata));
        assert!(vault.list().is_empty());
    }

    #[test]
    fn test_missing_image() {
        let work = tempfile::tempdir().unwrap();
        let vault = QuarantineVault::open(work.path().join("vault")).unwrap();
        assert!(matches!(
            vault.quarantine(&work.path().join("gone"), SubjectId::new(1, 1), 1),
            Err(ContainmentError::FileNotFound(_))
        ));
    }
}
