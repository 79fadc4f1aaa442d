//! Error types for the DriftMQ client library

use driftmq::DriftError;

/// Main error type for DriftMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Already subscribed to topic '{topic}'")]
    AlreadySubscribed { topic: String },

    #[error("Not subscribed to topic '{topic}'")]
    NotSubscribed { topic: String },

    #[error("Invalid topic name '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    /// The encoded PUBLISH would exceed the session's frame limit
    #[error("Message too large: {size} bytes exceeds frame limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// The session was closed; pending acknowledgements will never arrive
    #[error("Session closed")]
    Closed,

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl ClientError {
    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Reject topic names the broker would refuse before they reach the wire
pub(crate) fn check_topic(topic: &str) -> Result<(), ClientError> {
    match driftmq::validate_topic_name(topic) {
        Ok(()) => Ok(()),
        Err(DriftError::InvalidTopic { reason, .. }) => Err(ClientError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        }),
        Err(other) => Err(ClientError::invalid_config(other.to_string())),
    }
}
