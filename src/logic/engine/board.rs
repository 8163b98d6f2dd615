//! Subject board
//!
//! Latest snapshot of every live subject plus a bounded archive of
//! subjects that reached a terminal state. Read by the operator report.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use super::types::SubjectSnapshot;
use crate::logic::observer::SubjectId;

const ARCHIVE_LIMIT: usize = 512;

#[derive(Default)]
pub struct SubjectBoard {
    live: RwLock<HashMap<SubjectId, SubjectSnapshot>>,
    archived: RwLock<VecDeque<SubjectSnapshot>>,
}

impl SubjectBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, snapshot: SubjectSnapshot) {
        self.live.write().insert(snapshot.record.id, snapshot);
    }

    pub fn archive(&self, snapshot: SubjectSnapshot) {
        self.live.write().remove(&snapshot.record.id);
        let mut archived = self.archived.write();
        if archived.len() >= ARCHIVE_LIMIT {
            archived.pop_front();
        }
        archived.push_back(snapshot);
    }

    pub fn get(&self, id: &SubjectId) -> Option<SubjectSnapshot> {
        self.live
            .read()
            .get(id)
            .cloned()
            .or_else(|| self.archived.read().iter().rev().find(|s| s.record.id == *id).cloned())
    }

    /// Live subjects ordered by id
    pub fn live(&self) -> Vec<SubjectSnapshot> {
        let mut snapshots: Vec<SubjectSnapshot> = self.live.read().values().cloned().collect();
        snapshots.sort_by_key(|s| s.record.id);
        snapshots
    }

    /// Newest first
    pub fn archived(&self) -> Vec<SubjectSnapshot> {
        self.archived.read().iter().rev().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }
}
