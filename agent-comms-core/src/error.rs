//! Error types for agent-comms

use thiserror::Error;

/// The main error type for agent-comms operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Envelope or configuration validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// A request was not answered before its deadline
    #[error("Request timeout: {request_id} (after {timeout_ms}ms)")]
    Timeout { request_id: String, timeout_ms: u64 },

    /// The bus was shut down while a request was pending
    #[error("Bus shut down before request {0} was answered")]
    Shutdown(String),

    /// History store errors
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// A specialized Result type for agent-comms operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            request_id: "msg-1".to_string(),
            timeout_ms: 250,
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Request timeout: msg-1 (after 250ms)");
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
