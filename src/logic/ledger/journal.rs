//! Append-only hash-chained ledger
//!
//! A single writer seals entries in sequence order. Readers take a
//! snapshot through the entry lock and never block the writer for long.
//!
//! Two append modes:
//! - `append`: buffered. If storage is down the entry is sealed, kept in
//!   memory and written on the next successful append or flush.
//! - `append_durable`: the entry is on storage when this returns, or the
//!   call fails and the ledger is unchanged.

use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::chain::{self, GENESIS_HASH};
use super::storage::{LedgerStorage, MemoryStorage};
use super::types::{AuditEntry, AuditEvent, LedgerConfig, LedgerError};

/// Hook for mirroring entries to peer agents
pub trait PeerNotifier: Send + Sync {
    fn notify(&self, entry: &AuditEntry);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    Buffered,
    Required,
}

struct WriterState {
    next_seq: u64,
    head_hash: String,
    pending: VecDeque<Vec<u8>>,
    healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub entries: u64,
    pub pending: usize,
    pub durable: bool,
    pub head_hash: String,
    pub location: String,
}

pub struct Ledger {
    storage: Arc<dyn LedgerStorage>,
    entries: RwLock<Vec<AuditEntry>>,
    writer: Mutex<WriterState>,
    max_pending: usize,
    peers: RwLock<Vec<Arc<dyn PeerNotifier>>>,
}

impl Ledger {
    /// Replay and verify whatever the storage already holds
    pub fn open(storage: Arc<dyn LedgerStorage>, config: &LedgerConfig) -> Result<Self, LedgerError> {
        let bytes = storage
            .load()
            .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
        let (entries, valid_len, torn) = parse_records(&bytes)?;

        if torn {
            log::warn!(
                "Ledger {} ends with an unterminated record, truncating to {} bytes",
                storage.describe(),
                valid_len
            );
            storage
                .truncate(valid_len as u64)
                .map_err(|e| LedgerError::StorageUnavailable(e.to_string()))?;
        }

        chain::verify_chain(&entries)?;

        let (next_seq, head_hash) = entries
            .last()
            .map(|e| (e.seq + 1, e.hash.clone()))
            .unwrap_or((0, GENESIS_HASH.to_string()));

        log::info!(
            "Ledger opened at {} ({} entries verified)",
            storage.describe(),
            entries.len()
        );

        Ok(Self {
            storage,
            entries: RwLock::new(entries),
            writer: Mutex::new(WriterState {
                next_seq,
                head_hash,
                pending: VecDeque::new(),
                healthy: true,
            }),
            max_pending: config.max_pending.max(1),
            peers: RwLock::new(Vec::new()),
        })
    }

    /// Fresh ledger backed by memory
    pub fn in_memory() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    /// Fresh ledger on an empty backend
    pub fn with_storage(storage: Arc<dyn LedgerStorage>) -> Self {
        Self {
            storage,
            entries: RwLock::new(Vec::new()),
            writer: Mutex::new(WriterState {
                next_seq: 0,
                head_hash: GENESIS_HASH.to_string(),
                pending: VecDeque::new(),
                healthy: true,
            }),
            max_pending: LedgerConfig::default().max_pending,
            peers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, peer: Arc<dyn PeerNotifier>) {
        self.peers.write().push(peer);
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Append, buffering in memory if storage is unavailable
    pub fn append(&self, event: &AuditEvent) -> Result<u64, LedgerError> {
        self.commit(event, Durability::Buffered)
    }

    /// Append and require the entry to reach storage
    pub fn append_durable(&self, event: &AuditEvent) -> Result<u64, LedgerError> {
        self.commit(event, Durability::Required)
    }

    /// Append a pre-sealed entry (mirroring from a peer)
    pub fn append_entry(&self, entry: AuditEntry) -> Result<u64, LedgerError> {
        let mut writer = self.writer.lock();
        if entry.seq < writer.next_seq {
            return Err(LedgerError::DuplicateSequence(entry.seq));
        }
        if entry.seq > writer.next_seq {
            return Err(LedgerError::OutOfOrder {
                expected: writer.next_seq,
                actual: entry.seq,
            });
        }
        chain::verify_link(&entry, &writer.head_hash)?;
        self.persist_locked(&mut writer, entry, Durability::Required)
    }

    /// Write out buffered entries
    pub fn flush(&self) -> Result<(), LedgerError> {
        let mut writer = self.writer.lock();
        self.drain_locked(&mut writer);
        if writer.pending.is_empty() {
            Ok(())
        } else {
            Err(LedgerError::StorageUnavailable(format!(
                "{} entries awaiting storage",
                writer.pending.len()
            )))
        }
    }

    /// True when storage answers a probe and nothing is buffered
    pub fn is_durable(&self) -> bool {
        let mut writer = self.writer.lock();
        self.drain_locked(&mut writer);
        if !writer.pending.is_empty() {
            return false;
        }
        writer.healthy = self.storage.probe().is_ok();
        writer.healthy
    }

    fn commit(&self, event: &AuditEvent, durability: Durability) -> Result<u64, LedgerError> {
        let payload = serde_json::to_string(event)?;
        let mut writer = self.writer.lock();
        let entry = chain::seal(
            writer.next_seq,
            Utc::now().timestamp_millis(),
            event.kind(),
            payload,
            &writer.head_hash,
        );
        self.persist_locked(&mut writer, entry, durability)
    }

    fn persist_locked(
        &self,
        writer: &mut WriterState,
        entry: AuditEntry,
        durability: Durability,
    ) -> Result<u64, LedgerError> {
        let line = serde_json::to_vec(&entry)?;
        self.drain_locked(writer);

        if writer.pending.is_empty() {
            match self.storage.append(&line) {
                Ok(()) => writer.healthy = true,
                Err(e) => {
                    writer.healthy = false;
                    if durability == Durability::Required {
                        return Err(LedgerError::StorageUnavailable(e.to_string()));
                    }
                    log::warn!(
                        "Ledger storage {} unavailable, buffering entry {}: {}",
                        self.storage.describe(),
                        entry.seq,
                        e
                    );
                    self.buffer_locked(writer, line)?;
                }
            }
        } else if durability == Durability::Required {
            return Err(LedgerError::StorageUnavailable(format!(
                "{} earlier entries still awaiting storage",
                writer.pending.len()
            )));
        } else {
            self.buffer_locked(writer, line)?;
        }

        let seq = entry.seq;
        writer.next_seq = seq + 1;
        writer.head_hash = entry.hash.clone();
        self.entries.write().push(entry.clone());

        for peer in self.peers.read().iter() {
            peer.notify(&entry);
        }
        Ok(seq)
    }

    fn buffer_locked(&self, writer: &mut WriterState, line: Vec<u8>) -> Result<(), LedgerError> {
        if writer.pending.len() >= self.max_pending {
            return Err(LedgerError::BufferFull(writer.pending.len()));
        }
        writer.pending.push_back(line);
        Ok(())
    }

    fn drain_locked(&self, writer: &mut WriterState) {
        if writer.pending.is_empty() {
            return;
        }
        let backlog = writer.pending.len();
        while let Some(front) = writer.pending.front() {
            if self.storage.append(front).is_err() {
                writer.healthy = false;
                return;
            }
            writer.pending.pop_front();
        }
        writer.healthy = true;
        log::info!("Ledger storage recovered, wrote {} buffered entries", backlog);
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn read<R: RangeBounds<u64>>(&self, range: R) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let len = entries.len() as u64;
        let start = match range.start_bound() {
            Bound::Included(s) => *s,
            Bound::Excluded(s) => s.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(e) => e.saturating_add(1),
            Bound::Excluded(e) => *e,
            Bound::Unbounded => len,
        }
        .min(len);
        if start >= end {
            return Vec::new();
        }
        entries[start as usize..end as usize].to_vec()
    }

    /// Most recent entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        entries[skip..].to_vec()
    }

    /// Decoded events of one kind, in ledger order
    pub fn events_of_kind(&self, kind: &str) -> Vec<(u64, AuditEvent)> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.event().ok().map(|ev| (e.seq, ev)))
            .collect()
    }

    pub fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn head_hash(&self) -> String {
        self.writer.lock().head_hash.clone()
    }

    pub fn pending(&self) -> usize {
        self.writer.lock().pending.len()
    }

    /// Re-verify the in-memory chain
    pub fn verify(&self) -> Result<(), LedgerError> {
        chain::verify_chain(&self.entries.read())
    }

    pub fn status(&self) -> LedgerStatus {
        let durable = self.is_durable();
        let writer = self.writer.lock();
        LedgerStatus {
            entries: writer.next_seq,
            pending: writer.pending.len(),
            durable,
            head_hash: writer.head_hash.clone(),
            location: self.storage.describe(),
        }
    }
}

/// Split stored bytes into entries.
/// Returns the entries, the byte length of the terminated prefix and
/// whether an unterminated tail was found.
fn parse_records(bytes: &[u8]) -> Result<(Vec<AuditEntry>, usize, bool), LedgerError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    let mut line_no = 0;

    while offset < bytes.len() {
        line_no += 1;
        let Some(rel_end) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            return Ok((entries, offset, true));
        };
        let line = &bytes[offset..offset + rel_end];
        offset += rel_end + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry: AuditEntry = serde_json::from_slice(line).map_err(|e| LedgerError::Malformed {
            line: line_no,
            reason: e.to_string(),
        })?;
        entries.push(entry);
    }

    Ok((entries, offset, false))
}
