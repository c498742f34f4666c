//! Queue health and bus statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::Priority;
use super::history::HistoryBuffer;
use super::queue::PriorityQueue;

/// Queued critical envelopes above this count mark the queue critical
pub const CRITICAL_BACKLOG_THRESHOLD: usize = 10;

/// Utilization (percent) at which the queue is reported as `warning`
pub const WARNING_UTILIZATION_PERCENT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub status: HealthStatus,
    pub total_messages: usize,
    pub critical_messages: usize,
    pub expired_messages: usize,
    pub utilization_percent: u32,
}

impl QueueHealth {
    pub fn assess(queue: &PriorityQueue, now: DateTime<Utc>) -> Self {
        let total = queue.len();
        let max = queue.max_size();
        let critical = queue.count_priority(Priority::Critical);

        let status = if total >= max || critical > CRITICAL_BACKLOG_THRESHOLD {
            HealthStatus::Critical
        } else if total * 100 >= max * WARNING_UTILIZATION_PERCENT {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            total_messages: total,
            critical_messages: critical,
            expired_messages: queue.count_expired(now),
            utilization_percent: utilization_percent(total, max),
        }
    }
}

/// `round(len / max * 100)`
fn utilization_percent(len: usize, max: usize) -> u32 {
    if max == 0 {
        return 0;
    }
    let percent = (len as f64 / max as f64 * 100.0).round();
    percent.min(u32::MAX as f64) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    /// Envelopes currently held in history
    pub total_messages: usize,
    pub queued_messages: usize,
    pub active_subscriptions: usize,
    /// Delivered counts keyed by message type
    pub message_types: BTreeMap<String, usize>,
    /// Delivered counts keyed by sender
    pub agent_activity: BTreeMap<String, usize>,
    pub queue_health: QueueHealth,
    pub timestamp: DateTime<Utc>,
}

impl BusStats {
    pub fn collect(
        history: &HistoryBuffer,
        queue: &PriorityQueue,
        active_subscriptions: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let mut message_types = BTreeMap::new();
        let mut agent_activity = BTreeMap::new();
        for envelope in history.iter() {
            *message_types
                .entry(envelope.message_type.to_string())
                .or_insert(0) += 1;
            *agent_activity.entry(envelope.from.clone()).or_insert(0) += 1;
        }

        Self {
            total_messages: history.len(),
            queued_messages: queue.len(),
            active_subscriptions,
            message_types,
            agent_activity,
            queue_health: QueueHealth::assess(queue, now),
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::{Envelope, EnvelopeDraft, MessageType};
    use serde_json::json;
    use std::time::Duration;

    fn envelope(priority: Priority) -> Envelope {
        EnvelopeDraft::new("a", "b", json!(null))
            .with_priority(priority)
            .enrich(Duration::from_secs(30))
            .unwrap()
    }

    fn fill(queue: &mut PriorityQueue, count: usize, priority: Priority) {
        for _ in 0..count {
            queue.enqueue(envelope(priority));
        }
    }

    #[test]
    fn test_healthy_below_threshold() {
        let mut queue = PriorityQueue::new(1000);
        fill(&mut queue, 799, Priority::Normal);

        let health = QueueHealth::assess(&queue, Utc::now());
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.utilization_percent, 80);
    }

    #[test]
    fn test_warning_at_85_percent() {
        let mut queue = PriorityQueue::new(1000);
        fill(&mut queue, 850, Priority::Normal);

        let health = QueueHealth::assess(&queue, Utc::now());
        assert_eq!(health.status, HealthStatus::Warning);
        assert_eq!(health.utilization_percent, 85);
        assert_eq!(health.total_messages, 850);
    }

    #[test]
    fn test_critical_when_full() {
        let mut queue = PriorityQueue::new(5);
        fill(&mut queue, 5, Priority::High);

        let health = QueueHealth::assess(&queue, Utc::now());
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.utilization_percent, 100);
    }

    #[test]
    fn test_critical_backlog() {
        let mut queue = PriorityQueue::new(1000);
        fill(&mut queue, CRITICAL_BACKLOG_THRESHOLD + 1, Priority::Critical);

        let health = QueueHealth::assess(&queue, Utc::now());
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.critical_messages, 11);
        assert_eq!(health.utilization_percent, 1);
    }

    #[test]
    fn test_stats_breakdowns() {
        let mut history = HistoryBuffer::new(10);
        history.push(envelope(Priority::Normal));
        history.push(
            EnvelopeDraft::new("planner", "b", json!(null))
                .with_type(MessageType::Request)
                .enrich(Duration::from_secs(30))
                .unwrap(),
        );
        let queue = PriorityQueue::new(10);

        let stats = BusStats::collect(&history, &queue, 3, Utc::now());
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.active_subscriptions, 3);
        assert_eq!(stats.message_types["notification"], 1);
        assert_eq!(stats.message_types["request"], 1);
        assert_eq!(stats.agent_activity["a"], 1);
        assert_eq!(stats.agent_activity["planner"], 1);
        assert_eq!(stats.queue_health.status, HealthStatus::Healthy);
    }
}
