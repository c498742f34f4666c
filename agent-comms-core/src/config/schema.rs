//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for agent-comms
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Message bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Queue capacity before the overflow policy kicks in
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Number of delivered envelopes kept in history
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    /// Default TTL for envelopes and default request timeout, in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    /// Write a history snapshot after every dispatch
    #[serde(default)]
    pub persist_messages: bool,
    /// Snapshot file used by the JSON history store
    #[serde(default = "default_message_persist_path")]
    pub message_persist_path: PathBuf,
    /// How many of the newest history entries go into a snapshot
    #[serde(default = "default_persist_tail")]
    pub persist_tail: usize,
    /// Upper bound on envelopes delivered by a single drain cycle
    #[serde(default = "default_max_drain_per_cycle")]
    pub max_drain_per_cycle: usize,
    /// Buffer size of the bus event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_history_size() -> usize {
    500
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_message_persist_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agent-comms"))
        .unwrap_or_else(|| PathBuf::from(".agent-comms"))
        .join("messages.json")
}

fn default_persist_tail() -> usize {
    100
}

fn default_max_drain_per_cycle() -> usize {
    10_000
}

fn default_event_capacity() -> usize {
    256
}

impl BusConfig {
    /// Default TTL and request timeout as a `Duration`
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Enable persistence to the given snapshot file
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_messages = true;
        self.message_persist_path = path.into();
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_history_size: default_max_history_size(),
            message_timeout_ms: default_message_timeout_ms(),
            persist_messages: false,
            message_persist_path: default_message_persist_path(),
            persist_tail: default_persist_tail(),
            max_drain_per_cycle: default_max_drain_per_cycle(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_history_size, 500);
        assert_eq!(config.message_timeout(), Duration::from_secs(30));
        assert!(!config.persist_messages);
        assert!(config.message_persist_path.ends_with("messages.json"));
    }

    #[test]
    fn test_partial_bus_section_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"bus":{"max_queue_size":3}}"#).unwrap();
        assert_eq!(config.bus.max_queue_size, 3);
        assert_eq!(config.bus.persist_tail, 100);
        assert_eq!(config.logging.level, "info");
    }
}
