//! Error taxonomy for fleet orchestration
//!
//! Transient, machine-specific failures (`ConnectionFailure`, `AuthFailure`)
//! are the only ones the wait primitive retries. Everything else is terminal
//! for the operation that raised it and propagates to the caller unchanged.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// Connection refused, timed out or host unreachable
    #[error("Connection to {host} failed: {reason}")]
    ConnectionFailure { host: String, reason: String },

    /// Credentials were rejected by the remote host
    #[error("Authentication as {user}@{host} was rejected")]
    AuthFailure { host: String, user: String },

    /// A strictly checked remote command exited with a non-zero status
    #[error("Command `{command}` on {host} exited with status {status:?}: {output}")]
    RemoteCommandFailure {
        host: String,
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// Identity or network unreachable; terminal for the agent
    #[error("Could not access {user}@{host} with identity {identity}")]
    AccessFailure {
        user: String,
        host: String,
        identity: String,
    },

    /// Runtime missing or of the wrong version
    #[error("Runtime version {expected} is not installed on {host}")]
    RuntimeVersionFailure { host: String, expected: String },

    /// Load-generation tool missing or of the wrong version
    #[error("Load generation tool version {expected} is not installed on {host}")]
    ToolVersionFailure { host: String, expected: String },

    /// A bounded wait expired before its condition held
    #[error("Timeout after {elapsed:?} while waiting for {description} on {scope}")]
    OperationTimeout {
        description: String,
        scope: String,
        elapsed: Duration,
        last_error: Option<String>,
    },

    /// Any error surfaced by the compute back-end API
    #[error("Compute API call {operation} failed: {message}")]
    CloudApiFailure { operation: String, message: String },

    /// Invalid configuration or request
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// No machines left to assign from a fixed pool
    #[error("No machines left in pool {clusterable}")]
    PoolExhausted { clusterable: String },

    /// Load agent state machine rejected a transition
    #[error("Invalid load agent transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Persistence collaborator failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// Local filesystem or process spawning error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether the error is a transient network condition that the wait
    /// primitive may retry within its budget
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FleetError::ConnectionFailure { .. } | FleetError::AuthFailure { .. }
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        FleetError::Validation {
            message: message.into(),
        }
    }

    pub fn cloud_api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::CloudApiFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        FleetError::Store {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::store(err.to_string())
    }
}
