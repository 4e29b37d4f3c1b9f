//! Recent-run history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::job::JobOutcome;

/// One recorded run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: Uuid,
    pub context_id: String,
    pub operation: String,
    pub step_group_id: String,
    pub outcome: JobOutcome,
    pub data: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// History id used for a (context, operation) pair.
pub fn history_id(context_id: &str, operation: &str) -> String {
    format!("{}/{}", context_id, operation)
}

/// Storage for recent runs, newest first per history id.
pub trait HistoryStore: Send + Sync {
    fn record(&self, history_id: &str, entry: HistoryEntry);
    fn recent(&self, history_id: &str) -> Vec<HistoryEntry>;

    fn last(&self, history_id: &str) -> Option<HistoryEntry> {
        self.recent(history_id).into_iter().next()
    }
}

/// Bounded in-memory history.
///
/// An entry whose data equals an existing one replaces it at the front
/// instead of adding a duplicate.
#[derive(Debug)]
pub struct InMemoryHistory {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl HistoryStore for InMemoryHistory {
    fn record(&self, history_id: &str, entry: HistoryEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let list = entries.entry(history_id.to_string()).or_default();
        list.retain(|e| e.data != entry.data);
        list.push_front(entry);
        list.truncate(self.capacity);
        tracing::debug!(history_id, entries = list.len(), "Recorded run history");
    }

    fn recent(&self, history_id: &str) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(history_id)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}
