//! Error types for hire-bus

use thiserror::Error;

/// Boxed error returned by message handlers and wrapped operations
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the messaging core
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Broker connection failure (fatal at startup unless the connection is optional)
    #[error("Connection error: {0}")]
    Connection(String),

    /// No JetStream context is available (not connected, or JetStream disabled)
    #[error("JetStream not available")]
    JetStreamUnavailable,

    /// Publish failure
    #[error("Failed to publish message to subject '{subject}': {reason}")]
    Publish {
        subject: String,
        reason: String,
    },

    /// Subscription setup failure
    #[error("Failed to subscribe to subject '{subject}': {reason}")]
    SubscriptionSetup {
        subject: String,
        reason: String,
    },

    /// Handler did not settle within its timeout
    #[error("Handler for subject '{subject}' timed out after {timeout_ms}ms")]
    HandlerTimeout {
        subject: String,
        timeout_ms: u64,
    },

    /// Circuit breaker rejected the call without attempting it
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Create raced with another instance; the resource is already there
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by an upstream dependency (HTTP API, database, ...)
    ///
    /// Call sites wrapping outbound calls map their errors here so the
    /// retry predicate can inspect the status code.
    #[error("Upstream error{}: {message}", .status.map(|s| format!(" (status {})", s)).unwrap_or_default())]
    Upstream {
        status: Option<u16>,
        message: String,
    },
}

impl MessagingError {
    /// Build an upstream error carrying an HTTP-style status code
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }
}

/// Error returned when a circuit breaker is open
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is OPEN")]
pub struct CircuitOpenError {
    /// Name of the breaker that rejected the call
    pub name: String,
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_display() {
        let err = MessagingError::upstream(Some(503), "service unavailable");
        assert_eq!(err.to_string(), "Upstream error (status 503): service unavailable");

        let err = MessagingError::upstream(None, "socket hang up");
        assert_eq!(err.to_string(), "Upstream error: socket hang up");
    }

    #[test]
    fn test_circuit_open_converts() {
        let err: MessagingError = CircuitOpenError {
            name: "matcher.score.llm".to_string(),
        }
        .into();
        assert!(matches!(err, MessagingError::CircuitOpen(_)));
        assert_eq!(err.to_string(), "Circuit breaker 'matcher.score.llm' is OPEN");
    }
}
