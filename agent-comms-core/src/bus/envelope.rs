//! Envelope types carried by the message bus

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Recipient sentinel that matches every subscription
pub const BROADCAST_TARGET: &str = "all";

/// Unique envelope identifier
pub type MessageId = String;

/// Kind of envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    #[default]
    Notification,
    Broadcast,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Request,
        MessageType::Response,
        MessageType::Notification,
        MessageType::Broadcast,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Broadcast => "broadcast",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("invalid message type: {}", s)))
    }
}

/// Delivery urgency. Variants are declared most urgent first, so the
/// derived ordering sorts `Critical` before `Background`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase", try_from = "PriorityRepr")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric level, 1 (critical) to 5 (background)
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.level() == level)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    /// True when `self` is at least as urgent as `ceiling`
    pub fn is_at_least(&self, ceiling: Priority) -> bool {
        *self <= ceiling
    }

    /// Low and background traffic is shed first under backpressure
    pub fn is_sheddable(&self) -> bool {
        !self.is_at_least(Priority::Normal)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(level) = s.parse::<u8>() {
            return Self::from_level(level)
                .ok_or_else(|| Error::Validation(format!("invalid priority level: {}", level)));
        }
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("invalid priority: {}", s)))
    }
}

/// Wire form of a priority: a name or a numeric level
#[derive(Deserialize)]
#[serde(untagged)]
enum PriorityRepr {
    Level(u8),
    Name(String),
}

impl TryFrom<PriorityRepr> for Priority {
    type Error = String;

    fn try_from(repr: PriorityRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            PriorityRepr::Level(level) => {
                Priority::from_level(level).ok_or_else(|| format!("invalid priority level: {}", level))
            }
            PriorityRepr::Name(name) => name.parse().map_err(|e: Error| e.to_string()),
        }
    }
}

/// An enqueued message. Never mutated after it enters the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    /// Time to live in milliseconds
    #[serde(rename = "ttl")]
    pub ttl_ms: u64,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<MessageId>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_TARGET
    }

    /// Whether this envelope is addressed to `agent`, directly or via `all`
    pub fn is_for(&self, agent: &str) -> bool {
        self.to == agent || self.is_broadcast()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        self.timestamp
            .checked_add_signed(ChronoDuration::milliseconds(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Expired once `timestamp + ttl` has been reached
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Caller-supplied fields of an envelope, before enrichment.
///
/// Anything left unset is stamped by the bus at send time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvelopeDraft {
    pub id: Option<MessageId>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub message_type: Option<MessageType>,
    pub priority: Option<Priority>,
    #[serde(rename = "ttl")]
    pub ttl_ms: Option<u64>,
    pub from: String,
    pub to: String,
    pub request_id: Option<MessageId>,
    pub payload: serde_json::Value,
}

impl EnvelopeDraft {
    /// Create a notification draft
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Convert an untyped JSON object, rejecting unknown types and priorities
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Validation(e.to_string()))
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<MessageId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Stamp missing fields and validate the result
    pub fn enrich(self, default_ttl: Duration) -> Result<Envelope> {
        let default_ttl_ms = u64::try_from(default_ttl.as_millis()).unwrap_or(u64::MAX);
        let envelope = Envelope {
            id: self.id.unwrap_or_else(generate_message_id),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            message_type: self.message_type.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            ttl_ms: self.ttl_ms.filter(|ttl| *ttl > 0).unwrap_or(default_ttl_ms),
            from: self.from,
            to: self.to,
            request_id: self.request_id,
            payload: self.payload,
        };
        validate_envelope(&envelope)?;
        Ok(envelope)
    }
}

/// Data for answering a request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    /// Responding agent; `unknown` if unset
    pub from: Option<String>,
    /// Overrides the priority inherited from the request
    pub priority: Option<Priority>,
    pub payload: serde_json::Value,
}

impl ResponseData {
    pub fn new(from: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            from: Some(from.into()),
            priority: None,
            payload: payload.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Data for a broadcast to every subscriber
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastData {
    /// Broadcasting agent; `system` if unset
    pub from: Option<String>,
    pub priority: Option<Priority>,
    pub payload: serde_json::Value,
}

impl BroadcastData {
    pub fn new(from: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            from: Some(from.into()),
            priority: None,
            payload: payload.into(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

fn validate_envelope(envelope: &Envelope) -> Result<()> {
    let mut missing = Vec::new();
    if envelope.id.trim().is_empty() {
        missing.push("id");
    }
    if envelope.from.trim().is_empty() {
        missing.push("from");
    }
    if envelope.to.trim().is_empty() {
        missing.push("to");
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "envelope is missing required fields: {}",
            missing.join(", ")
        )))
    }
}

fn random_suffix(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

/// `msg-<unix millis>-<random>`
pub fn generate_message_id() -> MessageId {
    format!("msg-{}-{}", Utc::now().timestamp_millis(), random_suffix(9))
}

/// `sub-<agent>-<unix millis>-<random>`
pub fn generate_subscription_id(agent_name: &str) -> String {
    format!(
        "sub-{}-{}-{}",
        agent_name,
        Utc::now().timestamp_millis(),
        random_suffix(5)
    )
}
