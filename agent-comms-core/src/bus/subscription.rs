//! Subscription records and the matching predicate

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::envelope::{generate_subscription_id, Envelope, MessageType, Priority};

/// Subscription identifier, `sub-<agent>-...`
pub type SubscriptionId = String;

/// Callback invoked for every matching envelope
pub type DeliveryCallback = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

/// Optional predicate narrowing what a subscriber receives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    pub message_type: Option<MessageType>,
    pub from: Option<String>,
    /// Accept only envelopes at least this urgent
    pub priority: Option<Priority>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_priority(mut self, ceiling: Priority) -> Self {
        self.priority = Some(ceiling);
        self
    }

    /// Check the filter fields only; addressing is checked separately
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        self.message_type.map_or(true, |t| envelope.message_type == t)
            && self.from.as_deref().map_or(true, |from| envelope.from == from)
            && self
                .priority
                .map_or(true, |ceiling| envelope.priority.is_at_least(ceiling))
    }
}

/// One agent's interest in bus traffic
pub struct Subscription {
    id: SubscriptionId,
    agent_name: String,
    filter: MessageFilter,
    callback: DeliveryCallback,
    created_at: DateTime<Utc>,
    delivered: AtomicU64,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(agent_name: impl Into<String>, callback: DeliveryCallback, filter: MessageFilter) -> Self {
        let agent_name = agent_name.into();
        Self {
            id: generate_subscription_id(&agent_name),
            agent_name,
            filter,
            callback,
            created_at: Utc::now(),
            delivered: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Invoke the callback, isolating errors and panics.
    ///
    /// Returns true when the callback completed successfully.
    pub fn deliver(&self, envelope: &Envelope) -> bool {
        if !self.is_active() {
            return false;
        }

        match catch_unwind(AssertUnwindSafe(|| (self.callback)(envelope))) {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                error!(
                    subscription = %self.id,
                    message_id = %envelope.id,
                    "Error delivering message to {}: {:#}",
                    self.agent_name,
                    e
                );
                false
            }
            Err(_) => {
                error!(
                    subscription = %self.id,
                    message_id = %envelope.id,
                    "Subscriber {} panicked while handling message",
                    self.agent_name
                );
                false
            }
        }
    }

    pub fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            agent_name: self.agent_name.clone(),
            filter: self.filter.clone(),
            delivered_count: self.delivered_count(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("agent_name", &self.agent_name)
            .field("filter", &self.filter)
            .field("delivered", &self.delivered_count())
            .finish_non_exhaustive()
    }
}

/// Snapshot of a subscription for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub agent_name: String,
    pub filter: MessageFilter,
    pub delivered_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Whether `subscription` should receive `envelope`
pub fn matches(envelope: &Envelope, subscription: &Subscription) -> bool {
    envelope.is_for(&subscription.agent_name) && subscription.filter.accepts(envelope)
}

/// Active subscriptions in registration order
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id.clone();
        debug!("Agent {} subscribed ({})", subscription.agent_name, id);
        self.subscriptions.push(Arc::new(subscription));
        id
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(index) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let removed = self.subscriptions.remove(index);
        removed.deactivate();
        debug!("Agent {} unsubscribed ({})", removed.agent_name, id);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Subscription>> {
        self.subscriptions.iter().find(|s| s.id == id)
    }

    /// Subscriptions that should receive `envelope`, in registration order
    pub fn matching(&self, envelope: &Envelope) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .iter()
            .filter(|s| matches(envelope, s))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.subscriptions.iter()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.deactivate();
        }
    }
}
