//! Message bus for decoupled agent communication
//!
//! Agents subscribe by name, publish envelopes that are delivered in
//! priority order, and can call each other with correlated
//! request/response pairs. Delivered envelopes are kept in a bounded
//! history that may be persisted between runs.

pub mod envelope;
pub mod events;
pub mod health;
pub mod history;
pub mod message_bus;
pub mod queue;
pub mod subscription;

pub use envelope::{
    BroadcastData, Envelope, EnvelopeDraft, MessageId, MessageType, Priority, ResponseData,
    BROADCAST_TARGET,
};
pub use events::BusEvent;
pub use health::{BusStats, HealthStatus, QueueHealth};
pub use history::{
    HistoryBuffer, HistoryQuery, HistorySnapshot, HistoryStore, JsonFileStore, MemoryStore,
};
pub use message_bus::MessageBus;
pub use queue::{EnqueueOutcome, PriorityQueue};
pub use subscription::{
    matches, DeliveryCallback, MessageFilter, Subscription, SubscriptionId, SubscriptionInfo,
    SubscriptionRegistry,
};
