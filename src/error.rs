//! Error types for signalgraph.
//!
//! All errors are strongly typed using thiserror. Construction-time problems
//! surface as [`ValidationError`]; delivery problems never escape a notifier
//! and are only reported through [`DeliveryError`] inside a delivery report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors raised while constructing or wiring components.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required argument '{field}' is missing")]
    MissingArgument {
        field: String,
    },

    #[error("MultiEnvironment expects a state of type Array, found '{found}'")]
    StateNotSequence {
        found: String,
    },

    #[error("MultiEnvironment expects a state of type Array of type Environment, found '{found}' at index {index}")]
    NotAnEnvironment {
        index: usize,
        found: String,
    },

    #[error("Conciliation error: the object has not been correctly turned into a property: '{name}'")]
    Conciliation {
        name: String,
    },

    #[error("Environment '{name}' would contain its own parent composite")]
    CyclicComposition {
        name: String,
    },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Failures of an external delivery.
///
/// These are recovered by the notifier and attached to the `Delivered` event.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("Sink unreachable: {message}")]
    Unreachable {
        message: String,
    },

    #[error("Sink rejected delivery: {message}")]
    Rejected {
        message: String,
    },

    #[error("Transform failed: {message}")]
    Transform {
        message: String,
    },

    #[error("Delivery panicked: {message}")]
    Panicked {
        message: String,
    },
}

/// Execution errors raised by the scheduler and event streams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to spawn timer thread: {reason}")]
    SchedulerSpawn {
        reason: String,
    },
}

/// Top-level error type for signalgraph.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SignalError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
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

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for signalgraph operations.
pub type SignalResult<T> = Result<T, SignalError>;
