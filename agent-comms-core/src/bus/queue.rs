//! Bounded priority queue with TTL purging and load shedding

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::envelope::{Envelope, Priority};

/// Result of a single enqueue call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOutcome {
    /// Whether the new envelope made it into the queue
    pub queued: bool,
    /// Expired entries purged before insertion
    pub expired: Vec<Envelope>,
    /// Entries evicted by the overflow policy
    pub evicted: Vec<Envelope>,
}

#[derive(Debug)]
struct QueuedEnvelope {
    seq: u64,
    envelope: Envelope,
}

/// Pending envelopes, most urgent at the head.
///
/// Ties keep FIFO order. The queue never holds more than `max_size` entries.
#[derive(Debug)]
pub struct PriorityQueue {
    entries: VecDeque<QueuedEnvelope>,
    max_size: usize,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert an envelope using the wall clock for expiry
    pub fn enqueue(&mut self, envelope: Envelope) -> EnqueueOutcome {
        self.enqueue_at(envelope, Utc::now())
    }

    /// Insert an envelope, purging entries already expired at `now`.
    ///
    /// At capacity, every low/background entry is dropped (the incoming one
    /// included) and the rest is cut down to the newest `max_size - 1`.
    pub fn enqueue_at(&mut self, envelope: Envelope, now: DateTime<Utc>) -> EnqueueOutcome {
        let expired = self.purge_expired(now);
        let mut evicted = Vec::new();

        if self.entries.len() >= self.max_size {
            evicted = self.shed_overflow();
            if envelope.priority.is_sheddable() {
                warn!(
                    "Queue full, shedding {} envelope {}",
                    envelope.priority, envelope.id
                );
                return EnqueueOutcome {
                    queued: false,
                    expired,
                    evicted,
                };
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let position = self
            .entries
            .iter()
            .position(|e| e.envelope.priority > envelope.priority)
            .unwrap_or(self.entries.len());
        self.entries
            .insert(position, QueuedEnvelope { seq, envelope });

        EnqueueOutcome {
            queued: true,
            expired,
            evicted,
        }
    }

    /// Remove the most urgent envelope
    pub fn pop(&mut self) -> Option<Envelope> {
        self.entries.pop_front().map(|e| e.envelope)
    }

    /// Remove everything in priority order
    pub fn drain_all(&mut self) -> Vec<Envelope> {
        self.entries.drain(..).map(|e| e.envelope).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter().map(|e| &e.envelope)
    }

    pub fn count_priority(&self, priority: Priority) -> usize {
        self.iter().filter(|e| e.priority == priority).count()
    }

    pub fn count_expired(&self, now: DateTime<Utc>) -> usize {
        self.iter().filter(|e| e.is_expired_at(now)).count()
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<Envelope> {
        let purged = self.remove_where(|e| e.envelope.is_expired_at(now));
        if !purged.is_empty() {
            debug!("Purged {} expired envelopes from queue", purged.len());
        }
        purged
    }

    fn shed_overflow(&mut self) -> Vec<Envelope> {
        let mut evicted = self.remove_where(|e| e.envelope.priority.is_sheddable());

        let keep = self.max_size - 1;
        if self.entries.len() > keep {
            let mut by_age: Vec<u64> = self.entries.iter().map(|e| e.seq).collect();
            by_age.sort_unstable();
            let cutoff = by_age.get(by_age.len() - keep).copied().unwrap_or(u64::MAX);
            evicted.extend(self.remove_where(|e| e.seq < cutoff));
        }

        warn!(
            "Queue at capacity ({}), evicted {} envelopes",
            self.max_size,
            evicted.len()
        );
        evicted
    }

    /// Remove matching entries, keeping the rest in order
    fn remove_where(&mut self, mut predicate: impl FnMut(&QueuedEnvelope) -> bool) -> Vec<Envelope> {
        let (removed, kept): (VecDeque<_>, VecDeque<_>) =
            self.entries.drain(..).partition(|e| predicate(e));
        self.entries = kept;
        removed.into_iter().map(|e| e.envelope).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::EnvelopeDraft;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;

    fn envelope(id: &str, priority: Priority) -> Envelope {
        EnvelopeDraft::new("tester", "worker", json!(null))
            .with_id(id)
            .with_priority(priority)
            .enrich(Duration::from_secs(30))
            .unwrap()
    }

    fn ids(queue: &PriorityQueue) -> Vec<String> {
        queue.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_orders_by_priority_then_fifo() {
        let mut queue = PriorityQueue::new(10);
        queue.enqueue(envelope("low", Priority::Low));
        queue.enqueue(envelope("n1", Priority::Normal));
        queue.enqueue(envelope("crit", Priority::Critical));
        queue.enqueue(envelope("n2", Priority::Normal));
        queue.enqueue(envelope("high", Priority::High));

        assert_eq!(ids(&queue), vec!["crit", "high", "n1", "n2", "low"]);

        let drained: Vec<_> = queue.drain_all().into_iter().map(|e| e.priority).collect();
        assert!(drained.windows(2).all(|w| w[0] <= w[1]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_purges_expired_before_insert() {
        let mut queue = PriorityQueue::new(10);
        let stale = EnvelopeDraft::new("a", "b", json!(null))
            .with_id("stale")
            .with_ttl(Duration::from_millis(100))
            .enrich(Duration::from_secs(30))
            .unwrap();
        let now = stale.timestamp;
        queue.enqueue_at(stale, now);

        let outcome = queue.enqueue_at(
            envelope("fresh", Priority::Normal),
            now + ChronoDuration::milliseconds(100),
        );

        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].id, "stale");
        assert_eq!(ids(&queue), vec!["fresh"]);
    }

    #[test]
    fn test_overflow_sheds_all_background() {
        let mut queue = PriorityQueue::new(3);
        for i in 0..3 {
            queue.enqueue(envelope(&format!("bg{}", i), Priority::Background));
        }
        let outcome = queue.enqueue(envelope("bg3", Priority::Background));

        assert!(!outcome.queued);
        let evicted: Vec<_> = outcome.evicted.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(evicted, vec!["bg0", "bg1", "bg2"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_overflow_keeps_urgent_and_never_exceeds_capacity() {
        let mut queue = PriorityQueue::new(4);
        let mix = [
            Priority::Low,
            Priority::Critical,
            Priority::Background,
            Priority::Normal,
            Priority::High,
            Priority::Low,
            Priority::Normal,
            Priority::Critical,
        ];
        for (i, priority) in mix.into_iter().enumerate() {
            queue.enqueue(envelope(&format!("m{}", i), priority));
            assert!(queue.len() <= 4);
        }

        assert!(queue.iter().all(|e| !e.priority.is_sheddable()));
    }

    #[test]
    fn test_overflow_truncates_oldest_first() {
        let mut queue = PriorityQueue::new(3);
        queue.enqueue(envelope("old-normal", Priority::Normal));
        queue.enqueue(envelope("crit", Priority::Critical));
        queue.enqueue(envelope("new-normal", Priority::Normal));

        let outcome = queue.enqueue(envelope("incoming", Priority::High));

        assert!(outcome.queued);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].id, "old-normal");
        assert_eq!(ids(&queue), vec!["crit", "incoming", "new-normal"]);
    }

    #[test]
    fn test_counts() {
        let mut queue = PriorityQueue::new(10);
        queue.enqueue(envelope("c1", Priority::Critical));
        queue.enqueue(envelope("c2", Priority::Critical));
        queue.enqueue(envelope("n", Priority::Normal));

        assert_eq!(queue.count_priority(Priority::Critical), 2);
        assert_eq!(queue.count_expired(Utc::now()), 0);
        assert_eq!(queue.pop().unwrap().id, "c1");
    }
}
