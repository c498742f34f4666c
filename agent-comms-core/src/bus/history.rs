//! Delivered-message history and its durable snapshot

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::envelope::Envelope;
use super::subscription::MessageFilter;
use crate::error::{Error, Result};

/// Filter for querying history on behalf of an agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(flatten)]
    pub filter: MessageFilter,
    /// Only entries stamped at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        self.filter.accepts(envelope) && self.since.map_or(true, |since| envelope.timestamp >= since)
    }
}

/// Bounded log of delivered envelopes, oldest first
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<Envelope>,
    max_size: usize,
}

impl HistoryBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Seed from a previously saved snapshot, keeping the newest entries
    pub fn with_entries(max_size: usize, entries: Vec<Envelope>) -> Self {
        let mut buffer = Self::new(max_size);
        for envelope in entries {
            buffer.push(envelope);
        }
        buffer
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.entries.push_back(envelope);
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter()
    }

    /// Entries addressed to `agent` (or `all`) that pass `query`
    pub fn for_agent(&self, agent: &str, query: &HistoryQuery) -> Vec<Envelope> {
        self.entries
            .iter()
            .filter(|e| e.is_for(agent) && query.accepts(e))
            .cloned()
            .collect()
    }

    /// The newest `count` entries, oldest first
    pub fn tail(&self, count: usize) -> Vec<Envelope> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// Persisted form of the history tail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    #[serde(default)]
    pub history: Vec<Envelope>,
    pub timestamp: DateTime<Utc>,
}

impl HistorySnapshot {
    pub fn new(history: Vec<Envelope>) -> Self {
        Self {
            history,
            timestamp: Utc::now(),
        }
    }
}

/// Durable storage for history snapshots.
///
/// Failures are reported to the caller; the bus logs and ignores them.
pub trait HistoryStore: Send + Sync {
    /// Read the last saved snapshot, if any
    fn load(&self) -> Result<Option<HistorySnapshot>>;

    /// Replace the saved snapshot
    fn save(&self, snapshot: &HistorySnapshot) -> Result<()>;
}

/// Stores the snapshot as pretty-printed JSON in a single file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> Result<Option<HistorySnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let snapshot: HistorySnapshot = serde_json::from_str(&content)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))?;
        debug!(
            "Loaded {} persisted messages from {}",
            snapshot.history.len(),
            self.path.display()
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &HistorySnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Keeps the snapshot in memory; for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<HistorySnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: HistorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<HistorySnapshot> {
        self.snapshot.lock().clone()
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> Result<Option<HistorySnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &HistorySnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{EnvelopeDraft, MessageType, Priority, BROADCAST_TARGET};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn envelope(id: &str, from: &str, to: &str) -> Envelope {
        EnvelopeDraft::new(from, to, json!({"id": id}))
            .with_id(id)
            .enrich(Duration::from_secs(30))
            .unwrap()
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut buffer = HistoryBuffer::new(2);
        buffer.push(envelope("1", "a", "b"));
        buffer.push(envelope("2", "a", "b"));
        buffer.push(envelope("3", "a", "b"));

        let ids: Vec<_> = buffer.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[test]
    fn test_for_agent_includes_broadcasts() {
        let mut buffer = HistoryBuffer::new(10);
        buffer.push(envelope("direct", "a", "mixer"));
        buffer.push(envelope("other", "a", "router"));
        buffer.push(envelope("all", "system", BROADCAST_TARGET));

        let ids: Vec<_> = buffer
            .for_agent("mixer", &HistoryQuery::new())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["direct", "all"]);
    }

    #[test]
    fn test_for_agent_applies_filters_and_since() {
        let mut buffer = HistoryBuffer::new(10);
        let old = EnvelopeDraft::new("planner", "mixer", json!(null))
            .with_id("old")
            .with_timestamp(Utc::now() - ChronoDuration::minutes(5))
            .enrich(Duration::from_secs(30))
            .unwrap();
        buffer.push(old);
        buffer.push(envelope("from-planner", "planner", "mixer"));
        buffer.push(envelope("from-router", "router", "mixer"));
        let urgent = EnvelopeDraft::new("planner", "mixer", json!(null))
            .with_id("urgent")
            .with_type(MessageType::Error)
            .with_priority(Priority::Critical)
            .enrich(Duration::from_secs(30))
            .unwrap();
        buffer.push(urgent);

        let query = HistoryQuery::new()
            .with_filter(MessageFilter::new().with_from("planner"))
            .since(Utc::now() - ChronoDuration::minutes(1));
        let ids: Vec<_> = buffer.for_agent("mixer", &query).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["from-planner", "urgent"]);

        let query = HistoryQuery::new().with_filter(
            MessageFilter::new()
                .with_type(MessageType::Error)
                .with_priority(Priority::High),
        );
        let ids: Vec<_> = buffer.for_agent("mixer", &query).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["urgent"]);
    }

    #[test]
    fn test_tail() {
        let buffer = HistoryBuffer::with_entries(
            10,
            (0..5).map(|i| envelope(&i.to_string(), "a", "b")).collect(),
        );
        let ids: Vec<_> = buffer.tail(2).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["3", "4"]);
        assert_eq!(buffer.tail(50).len(), 5);
    }

    #[test]
    fn test_json_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nested").join("messages.json"));

        assert!(store.load().unwrap().is_none());

        let snapshot = HistorySnapshot::new(vec![envelope("1", "a", "b")]);
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_json_store_reports_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("messages.json");
        std::fs::write(&path, "not json").unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn test_json_store_reads_numeric_priorities() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("messages.json");
        std::fs::write(
            &path,
            r#"{
  "history": [{
    "id": "msg-1", "timestamp": "2024-05-01T10:00:00Z", "type": "notification",
    "priority": 1, "ttl": 30000, "from": "guardian", "to": "all", "payload": {}
  }],
  "timestamp": "2024-05-01T10:00:01Z"
}"#,
        )
        .unwrap();

        let snapshot = JsonFileStore::new(&path).load().unwrap().unwrap();
        assert_eq!(snapshot.history[0].priority, Priority::Critical);
    }
}
