//! Error taxonomy shared by every IoT swarm crate.
//!
//! Errors carry plain string context so they can be cloned into device and
//! upload reports. Whether an error is worth retrying is a property of the
//! variant, see [`IotSwarmError::is_retryable`].

use std::fmt;
use thiserror::Error;

/// Result type for IoT swarm operations
pub type IotSwarmResult<T> = std::result::Result<T, IotSwarmError>;

/// Errors raised by data sources, sinks, the checkpoint store and the
/// orchestration layers above them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IotSwarmError {
    /// Network level failure talking to a source or sink
    #[error("Connection error: {0}")]
    Connection(String),

    /// An operation did not complete within its deadline
    #[error("Operation '{operation}' timed out after {after_ms}ms")]
    Timeout {
        operation: String,
        after_ms: u64,
    },

    /// Authentication or authorization rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The data source rejected or failed a query
    #[error("Query error: {0}")]
    Query(String),

    /// The sink failed to accept a payload
    #[error("Publish error: {0}")]
    Publish(String),

    /// Checkpoint state could not be decoded
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// Checkpoint state could not be persisted
    #[error("State write error: {0}")]
    StateWrite(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation observed the stop signal
    #[error("Operation cancelled")]
    Cancelled,

    /// A retryable operation failed on every permitted attempt
    #[error("Operation '{operation}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<IotSwarmError>,
    },

    /// A task ended abnormally
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IotSwarmError {
    pub fn connection<T: fmt::Display>(msg: T) -> Self {
        Self::Connection(msg.to_string())
    }

    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Self::Auth(msg.to_string())
    }

    pub fn query<T: fmt::Display>(msg: T) -> Self {
        Self::Query(msg.to_string())
    }

    pub fn publish<T: fmt::Display>(msg: T) -> Self {
        Self::Publish(msg.to_string())
    }

    pub fn corruption<T: fmt::Display>(msg: T) -> Self {
        Self::StateCorruption(msg.to_string())
    }

    pub fn state_write<T: fmt::Display>(msg: T) -> Self {
        Self::StateWrite(msg.to_string())
    }

    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn serialization<T: fmt::Display>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Self::Internal(msg.to_string())
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Check if this error is transient and the operation may be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::Query(_) | Self::Publish(_)
        )
    }

    /// Check if this error is the stop signal rather than a failure
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The innermost error, looking through [`IotSwarmError::RetriesExhausted`]
    #[must_use]
    pub fn root_cause(&self) -> &IotSwarmError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for IotSwarmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_classification() {
        assert!(IotSwarmError::connection("reset").is_retryable());
        assert!(IotSwarmError::timeout("publish", Duration::from_secs(1)).is_retryable());
        assert!(IotSwarmError::query("ORA-03113").is_retryable());
        assert!(IotSwarmError::publish("broker busy").is_retryable());

        assert!(!IotSwarmError::auth("bad certificate").is_retryable());
        assert!(!IotSwarmError::config("missing table").is_retryable());
        assert!(!IotSwarmError::state_write("disk full").is_retryable());
        assert!(!IotSwarmError::Cancelled.is_retryable());
    }

    #[test]
    fn test_root_cause_unwraps_exhausted_retries() {
        let err = IotSwarmError::RetriesExhausted {
            operation: "publish".to_string(),
            attempts: 3,
            last: Box::new(IotSwarmError::publish("broker busy")),
        };

        assert_eq!(err.root_cause(), &IotSwarmError::publish("broker busy"));
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
