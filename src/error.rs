//! Error types for querybridge.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions (queue full, timeout, malformed payload) instead of
//! inspecting strings.

use thiserror::Error;

use crate::query::QueryId;

/// Validation errors raised before a request crosses the boundary.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid variables object: {reason}")]
    InvalidVariables {
        reason: String,
    },

    #[error("Unknown query id: {id}")]
    UnknownQuery {
        id: QueryId,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Frame of {actual} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        actual: usize,
        max: usize,
    },
}

/// Execution errors raised while a request is in flight.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Engine error: {message}")]
    Engine {
        message: String,
    },

    #[error("Unexpected response to '{request}': {response}")]
    UnexpectedResponse {
        request: String,
        response: String,
    },
}

/// Transport errors for messages crossing the boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to serialize message: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize payload: {message}")]
    DeserializationFailed {
        message: String,
    },

    #[error("Server error: {message}")]
    ServerError {
        message: String,
    },
}

/// Top-level error type for querybridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl BridgeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a disconnected-channel error for `path`.
    #[must_use]
    pub fn disconnected(path: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Disconnected { path: path.into() })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Engine faults are fatal to the bridge and never retried; only
    /// back-pressure and timeouts are.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }),
            Self::Validation(_) | Self::Transport(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for querybridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_variables() {
        let err = ValidationError::InvalidVariables {
            reason: "expected object".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Invalid variables"));
        assert!(msg.contains("expected object"));
    }

    #[test]
    fn test_validation_error_unknown_query() {
        let err = ValidationError::UnknownQuery { id: QueryId::new(7) };
        assert!(format!("{err}").contains('7'));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        let msg = format!("{err}");
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn test_transport_error_deserialization() {
        let err = TransportError::DeserializationFailed {
            message: "expected value at line 1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("deserialize"));
        assert!(msg.contains("line 1"));
    }

    #[test]
    fn test_bridge_error_from_validation() {
        let bridge_err: BridgeError = ValidationError::FrameTooLarge { actual: 2, max: 1 }.into();
        assert!(bridge_err.is_validation());
        assert!(!bridge_err.is_retryable());
    }

    #[test]
    fn test_bridge_error_from_execution() {
        let bridge_err: BridgeError = ExecutionError::Timeout { duration_ms: 1000 }.into();
        assert!(bridge_err.is_execution());
        assert!(bridge_err.is_retryable());
    }

    #[test]
    fn test_bridge_error_disconnected_not_retryable() {
        let err = BridgeError::disconnected("host_requests");
        assert!(err.is_execution());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("host_requests"));
    }

    #[test]
    fn test_bridge_error_internal() {
        let err = BridgeError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }

    #[test]
    fn test_bridge_error_from_transport() {
        let err: BridgeError = TransportError::ServerError {
            message: "boom".to_string(),
        }
        .into();
        assert!(err.is_transport());
        assert!(!err.is_retryable());
    }
}
