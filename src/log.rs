//! Per-orchestration append-only event log.
//!
//! Entries are offset-indexed, dense from zero, and idempotent by entry id:
//! re-appending a known id is a no-op. Readers get owned copies, so a
//! snapshot stays stable while new entries are appended behind it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Discriminates what a log entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    TaskOutput,
    TaskFailure,
    OrchestrationStatusChange,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Unique per log; usually the producing task's id.
    pub id: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub producer_id: String,
    pub attempt_num: u32,
}

impl LogEntry {
    /// Build an entry ready for appending; offset and timestamp are
    /// assigned by the log itself.
    pub fn new(
        entry_type: EntryType,
        id: impl Into<String>,
        value: Value,
        producer_id: impl Into<String>,
        attempt_num: u32,
    ) -> Self {
        Self {
            offset: 0,
            entry_type,
            id: id.into(),
            value,
            timestamp: Utc::now(),
            producer_id: producer_id.into(),
            attempt_num,
        }
    }
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    seen: HashSet<String>,
    current_offset: u64,
    last_accessed: Option<DateTime<Utc>>,
}

/// Append-only, offset-indexed event sequence for one orchestration.
#[derive(Default)]
pub struct Log {
    inner: RwLock<LogInner>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, assigning it the next offset. Appending an entry
    /// whose id is already present leaves the log unchanged.
    pub async fn append(&self, mut entry: LogEntry) {
        let mut inner = self.inner.write().await;
        if inner.seen.contains(&entry.id) {
            return;
        }
        entry.offset = inner.current_offset;
        entry.timestamp = Utc::now();
        inner.seen.insert(entry.id.clone());
        inner.entries.push(entry);
        inner.current_offset += 1;
        inner.last_accessed = Some(Utc::now());
    }

    /// Snapshot of all entries at offsets >= `offset`; empty when the
    /// offset is at or past the head.
    pub async fn read_from(&self, offset: u64) -> Vec<LogEntry> {
        let inner = self.inner.read().await;
        if offset >= inner.current_offset {
            return Vec::new();
        }
        inner.entries[offset as usize..].to_vec()
    }

    pub async fn current_offset(&self) -> u64 {
        self.inner.read().await.current_offset
    }
}
