//! Live host backend
//!
//! Uses sysinfo for the process table, resources and signals.
//! On Linux, open handles and socket endpoints come from /proc.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use sysinfo::{Pid, Signal, System};

use super::host::{ControlSignal, HostQuery, ProcessControl};
use super::types::{
    ChildSpawn, FileActivity, Handle, HostError, ProcessDescriptor, ProcessProbe, ResourceUsage,
    SubjectId,
};

#[derive(Debug, Clone)]
struct ProcessRecord {
    id: SubjectId,
    name: String,
    exe: Option<PathBuf>,
    parent_pid: Option<u32>,
    resources: ResourceUsage,
}

struct CachedHash {
    len: u64,
    modified: Option<SystemTime>,
    hash: String,
}

pub struct SysinfoHost {
    system: Mutex<System>,
    snapshot: RwLock<HashMap<u32, ProcessRecord>>,
    hash_cache: Mutex<HashMap<PathBuf, CachedHash>>,
    known_children: Mutex<HashMap<SubjectId, HashSet<SubjectId>>>,
}

impl SysinfoHost {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            snapshot: RwLock::new(HashMap::new()),
            hash_cache: Mutex::new(HashMap::new()),
            known_children: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, id: &SubjectId) -> Result<ProcessRecord, HostError> {
        match self.snapshot.read().get(&id.pid) {
            Some(record) if record.id == *id => Ok(record.clone()),
            _ => Err(HostError::NotFound(*id)),
        }
    }

    fn hash_image(&self, path: &Path) -> Option<String> {
        let meta = fs::metadata(path).ok()?;
        let modified = meta.modified().ok();
        {
            let cache = self.hash_cache.lock();
            if let Some(cached) = cache.get(path) {
                if cached.len == meta.len() && cached.modified == modified {
                    return Some(cached.hash.clone());
                }
            }
        }
        let hash = calculate_file_hash(path).ok()?;
        self.hash_cache.lock().insert(
            path.to_path_buf(),
            CachedHash {
                len: meta.len(),
                modified,
                hash: hash.clone(),
            },
        );
        Some(hash)
    }

    fn new_children(&self, id: &SubjectId) -> Vec<ChildSpawn> {
        let children: Vec<ProcessRecord> = self
            .snapshot
            .read()
            .values()
            .filter(|r| r.parent_pid == Some(id.pid) && r.id.start_time >= id.start_time)
            .cloned()
            .collect();

        let mut known = self.known_children.lock();
        let seen = match known.entry(*id) {
            // Children alive at the first probe were not spawned in this window
            Entry::Vacant(slot) => {
                slot.insert(children.into_iter().map(|c| c.id).collect());
                return Vec::new();
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };
        let mut spawns: Vec<ChildSpawn> = children
            .into_iter()
            .filter(|c| seen.insert(c.id))
            .map(|c| ChildSpawn {
                child: c.id,
                image_hash: c.exe.as_deref().and_then(|p| self.hash_image(p)),
                name: c.name,
            })
            .collect();
        spawns.sort_by_key(|s| s.child);
        spawns
    }
}

impl Default for SysinfoHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostQuery for SysinfoHost {
    fn enumerate(&self) -> Result<Vec<ProcessDescriptor>, HostError> {
        let mut system = self.system.lock();
        system.refresh_processes();

        let mut records = HashMap::with_capacity(system.processes().len());
        for (pid, process) in system.processes() {
            let disk = process.disk_usage();
            #[cfg(unix)]
            let effective_uid = process.effective_user_id().map(|uid| **uid);
            #[cfg(not(unix))]
            let effective_uid = None;

            records.insert(
                pid.as_u32(),
                ProcessRecord {
                    id: SubjectId::new(pid.as_u32(), process.start_time()),
                    name: process.name().to_string(),
                    exe: process.exe().map(Path::to_path_buf),
                    parent_pid: process.parent().map(|p| p.as_u32()),
                    resources: ResourceUsage {
                        cpu_percent: process.cpu_usage(),
                        memory_bytes: process.memory(),
                        disk_written_bytes: disk.total_written_bytes,
                        effective_uid,
                    },
                },
            );
        }
        drop(system);

        if records.is_empty() {
            return Err(HostError::Unavailable("process table is empty".to_string()));
        }

        let descriptors = records
            .values()
            .map(|r| ProcessDescriptor {
                id: r.id,
                name: r.name.clone(),
                exe_path: r.exe.clone(),
                parent: r.parent_pid.and_then(|pp| records.get(&pp)).map(|p| p.id),
            })
            .collect();

        let live: HashSet<SubjectId> = records.values().map(|r| r.id).collect();
        self.known_children.lock().retain(|id, _| live.contains(id));
        *self.snapshot.write() = records;
        Ok(descriptors)
    }

    fn probe(&self, id: &SubjectId) -> Result<ProcessProbe, HostError> {
        let record = self.record(id)?;
        let (handles, file_activity) = procfs::open_handles(id.pid).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => HostError::PermissionDenied(format!("/proc/{}/fd", id.pid)),
            io::ErrorKind::NotFound => HostError::NotFound(*id),
            _ => HostError::Unavailable(e.to_string()),
        })?;

        Ok(ProcessProbe {
            resources: record.resources.clone(),
            handles,
            file_activity,
            child_spawns: self.new_children(id),
            image_hash: record.exe.as_deref().and_then(|p| self.hash_image(p)),
        })
    }

    fn image_hash(&self, id: &SubjectId) -> Result<Option<String>, HostError> {
        let record = self.record(id)?;
        Ok(record.exe.as_deref().and_then(|p| self.hash_image(p)))
    }
}

impl ProcessControl for SysinfoHost {
    fn signal(&self, id: &SubjectId, signal: ControlSignal) -> Result<(), HostError> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(id.pid);
        if !system.refresh_process(pid) {
            return Err(HostError::NotFound(*id));
        }
        let process = system
            .process(pid)
            .filter(|p| p.start_time() == id.start_time)
            .ok_or(HostError::NotFound(*id))?;

        let native = match signal {
            ControlSignal::Terminate => Signal::Term,
            ControlSignal::Kill => Signal::Kill,
            ControlSignal::Suspend => Signal::Stop,
            ControlSignal::Resume => Signal::Continue,
        };
        match process.kill_with(native) {
            Some(true) => {
                log::info!("Sent {} to process {}", signal, id);
                Ok(())
            }
            Some(false) => Err(HostError::PermissionDenied(format!("{} to {}", signal, id))),
            None => Err(HostError::Unavailable(format!("{} is not supported on this platform", signal))),
        }
    }

    fn is_running(&self, id: &SubjectId) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(id.pid);
        system.refresh_process(pid)
            && system
                .process(pid)
                .map(|p| p.start_time() == id.start_time)
                .unwrap_or(false)
    }
}

/// Streamed SHA-256 of a file
pub fn calculate_file_hash(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// /proc
// ============================================================================

#[cfg(target_os = "linux")]
mod procfs {
    use std::collections::HashMap;
    use std::fs;
    use std::io;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::path::PathBuf;

    use super::{FileActivity, Handle};
    use crate::logic::observer::types::FileOp;

    const DELETED_SUFFIX: &str = " (deleted)";
    const TCP_LISTEN: &str = "0A";

    struct SocketInfo {
        remote: Option<String>,
        outbound: bool,
    }

    pub fn open_handles(pid: u32) -> io::Result<(Vec<Handle>, Vec<FileActivity>)> {
        let fd_dir = PathBuf::from(format!("/proc/{}/fd", pid));
        let entries = fs::read_dir(&fd_dir)?;
        let sockets = socket_table();

        let mut handles = Vec::new();
        let mut activity = Vec::new();

        for entry in entries.flatten() {
            let Ok(link) = fs::read_link(entry.path()) else {
                continue;
            };
            let target = link.to_string_lossy().to_string();

            if let Some(inode) = target.strip_prefix("socket:[").and_then(|s| s.strip_suffix(']')) {
                if let Some(info) = sockets.get(inode) {
                    handles.push(Handle::Socket {
                        remote: info.remote.clone(),
                        outbound: info.outbound,
                    });
                }
                continue;
            }

            if !target.starts_with('/') {
                handles.push(Handle::Other { target });
                continue;
            }

            let fd = entry.file_name().to_string_lossy().to_string();
            let writable = fd_writable(pid, &fd);

            if let Some(path) = target.strip_suffix(DELETED_SUFFIX) {
                activity.push(FileActivity {
                    path: PathBuf::from(path),
                    op: FileOp::Delete,
                    bytes: 0,
                    renamed_to: None,
                });
                continue;
            }

            let path = PathBuf::from(&target);
            if writable {
                activity.push(FileActivity {
                    path: path.clone(),
                    op: FileOp::Write,
                    bytes: fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                    renamed_to: None,
                });
            }
            handles.push(Handle::File { path, writable });
        }

        handles.sort();
        activity.sort_by(|a, b| a.path.cmp(&b.path));
        Ok((handles, activity))
    }

    fn fd_writable(pid: u32, fd: &str) -> bool {
        let Ok(info) = fs::read_to_string(format!("/proc/{}/fdinfo/{}", pid, fd)) else {
            return false;
        };
        info.lines()
            .find_map(|l| l.strip_prefix("flags:"))
            .and_then(|f| u32::from_str_radix(f.trim(), 8).ok())
            .map(|flags| flags & 0o3 != 0)
            .unwrap_or(false)
    }

    fn socket_table() -> HashMap<String, SocketInfo> {
        let mut table = HashMap::new();
        for (file, v6) in [("/proc/net/tcp", false), ("/proc/net/tcp6", true)] {
            let Ok(text) = fs::read_to_string(file) else {
                continue;
            };
            for line in text.lines().skip(1) {
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.len() < 10 {
                    continue;
                }
                let state = cols[3];
                let remote = decode_endpoint(cols[2], v6);
                table.insert(
                    cols[9].to_string(),
                    SocketInfo {
                        outbound: state != TCP_LISTEN && remote.is_some(),
                        remote,
                    },
                );
            }
        }
        table
    }

    /// Kernel hex endpoint ("0100007F:1F90") to "127.0.0.1:8080"
    fn decode_endpoint(raw: &str, v6: bool) -> Option<String> {
        let (addr, port) = raw.split_once(':')?;
        let port = u16::from_str_radix(port, 16).ok()?;
        if port == 0 {
            return None;
        }
        if v6 {
            if addr.len() != 32 {
                return None;
            }
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Some(format!("[{}]:{}", Ipv6Addr::from(octets), port))
        } else {
            let word = u32::from_str_radix(addr, 16).ok()?;
            Some(format!("{}:{}", Ipv4Addr::from(word.to_le_bytes()), port))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_decode_ipv4_endpoint() {
            assert_eq!(decode_endpoint("0100007F:1F90", false).as_deref(), Some("127.0.0.1:8080"));
            assert_eq!(decode_endpoint("00000000:0000", false), None);
        }

        #[test]
        fn test_own_handles_are_readable() {
            let (handles, _) = open_handles(std::process::id()).unwrap();
            assert!(!handles.is_empty());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod procfs {
    use std::io;

    use super::{FileActivity, Handle};

    pub fn open_handles(_pid: u32) -> io::Result<(Vec<Handle>, Vec<FileActivity>)> {
        Ok((Vec::new(), Vec::new()))
    }
}
