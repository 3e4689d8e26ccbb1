//! Error types for typedq operations.

use thiserror::Error;

/// Result type used throughout typedq.
pub type QueueResult<T> = Result<T, QueueError>;

/// Boxed error returned by job handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for typedq operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The job type cannot be used with a queue
    #[error("Invalid job type '{type_name}': {reason}")]
    InvalidJobType {
        /// Rust type name of the rejected job
        type_name: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// The queue or broker has been closed
    #[error("Queue is closed")]
    Closed,

    /// The operation was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A wire envelope could not be decoded
    #[error("Malformed envelope: {message}")]
    Envelope {
        /// Error message
        message: String,
    },

    /// A job handler returned an error
    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        /// Name of the failing handler
        handler: String,
        /// The error returned by the handler
        #[source]
        source: BoxError,
    },

    /// Transport-level error
    #[error("Broker error: {message}")]
    Broker {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Redis connection or command error
    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl QueueError {
    /// Create a new broker error wrapping a source error
    pub fn broker<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an envelope decoding error
    pub fn envelope(message: impl Into<String>) -> Self {
        Self::Envelope {
            message: message.into(),
        }
    }

    /// Whether this error signals cancellation or closure rather than a failure
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = QueueError::InvalidJobType {
            type_name: "u32",
            reason: "empty topic".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid job type 'u32': empty topic");

        let err = QueueError::Handler {
            handler: "send_email".to_string(),
            source: "smtp down".into(),
        };
        assert_eq!(err.to_string(), "Handler 'send_email' failed: smtp down");
    }

    #[test]
    fn test_is_shutdown() {
        assert!(QueueError::Cancelled.is_shutdown());
        assert!(QueueError::Closed.is_shutdown());
        assert!(!QueueError::config("bad").is_shutdown());
    }
}
