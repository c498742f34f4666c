//! Lifecycle events published by the message bus

use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, MessageId};

/// Something observable happened to an envelope.
///
/// Listeners that only care whether any broadcast occurred can watch for
/// [`BusEvent::Broadcast`] instead of subscribing per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "message", rename_all = "snake_case")]
pub enum BusEvent {
    /// Accepted into the queue
    Queued(Envelope),
    /// Rejected by the overflow policy
    Shed(Envelope),
    /// Dropped at dispatch because its TTL elapsed
    Expired(MessageId),
    /// Handed to every matching subscriber and recorded in history
    Delivered(Envelope),
    /// A delivered envelope of type `broadcast`
    Broadcast(Envelope),
}

impl BusEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Queued(e) | Self::Shed(e) | Self::Delivered(e) | Self::Broadcast(e) => &e.id,
            Self::Expired(id) => id,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::envelope::EnvelopeDraft;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_event_serialization() {
        let envelope = EnvelopeDraft::new("a", "b", json!(null))
            .with_id("msg-7")
            .enrich(Duration::from_secs(1))
            .unwrap();
        let value = serde_json::to_value(BusEvent::Delivered(envelope)).unwrap();

        assert_eq!(value["event"], "delivered");
        assert_eq!(value["message"]["id"], "msg-7");
    }

    #[test]
    fn test_message_id() {
        let event = BusEvent::Expired("msg-9".to_string());
        assert_eq!(event.message_id(), "msg-9");
        assert!(!event.is_broadcast());
    }
}
