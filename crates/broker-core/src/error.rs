// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for broker-core.
//!
//! [`CoreError`] is what the engine hands back to its callers. Steps never
//! produce it directly: they report a [`StepError`], which the executor maps
//! onto instance state before converting it.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the lifecycle engine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in persistence.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Instance already exists with a different identity.
    #[error("Instance '{instance_id}' already exists")]
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Instance is in an invalid state for the requested operation.
    #[error("Instance '{instance_id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidInstanceState {
        /// The instance ID.
        instance_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// No service module is registered under the given service ID.
    #[error("No service registered for '{service_id}'")]
    UnknownService {
        /// The service ID that was looked up.
        service_id: String,
    },

    /// The registry has no step sequence for a (service, plan, operation) triple.
    #[error("No {operation} sequence registered for service '{service_id}' plan '{plan_id}'")]
    NoSequence {
        /// Service ID.
        service_id: String,
        /// Plan ID.
        plan_id: String,
        /// Lifecycle operation.
        operation: String,
    },

    /// Stored details do not match the shape the registered module expects.
    #[error("Corrupt or incompatible instance state: {reason}")]
    CorruptState {
        /// What did not match.
        reason: String,
    },

    /// A step reported a hard failure; the instance is now failed.
    #[error("Step '{step}' failed for instance '{instance_id}': {message}")]
    StepFailed {
        /// The instance ID.
        instance_id: String,
        /// The failing step.
        step: String,
        /// Cause reported by the step.
        message: String,
    },

    /// A step reported a retryable failure; no progress was recorded.
    #[error("Transient failure in step '{step}' for instance '{instance_id}': {message}")]
    Transient {
        /// The instance ID.
        instance_id: String,
        /// The step that will be retried.
        step: String,
        /// Cause reported by the step.
        message: String,
    },

    /// An asynchronous operation exceeded its deadline.
    #[error("Operation for instance '{instance_id}' timed out in step '{step}'")]
    Timeout {
        /// The instance ID.
        instance_id: String,
        /// The step that was still in progress.
        step: String,
    },

    /// Execution was cancelled before the current step committed.
    #[error("Execution of instance '{instance_id}' was cancelled")]
    Cancelled {
        /// The instance ID.
        instance_id: String,
    },

    /// Sealing or opening sensitive details failed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::UnknownService { .. } => "UNKNOWN_SERVICE",
            Self::NoSequence { .. } => "NO_SEQUENCE",
            Self::CorruptState { .. } => "CORRUPT_STATE",
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::Transient { .. } => "TRANSIENT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Encryption(_) => "ENCRYPTION_ERROR",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether a later call may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Cancelled { .. } | Self::DatabaseError { .. }
        )
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptState {
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Failure reported by a single step.
///
/// This is the whole taxonomy a step may use; backend-specific errors are
/// converted into one of these variants inside the service module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network blip, throttling: the same step is retried later.
    #[error("transient: {0}")]
    Transient(String),

    /// Conflict, invalid configuration, quota: the instance fails.
    #[error("{0}")]
    Hard(String),

    /// The step could not interpret the instance details.
    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl StepError {
    /// Build a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Build a hard error.
    pub fn hard(message: impl Into<String>) -> Self {
        Self::Hard(message.into())
    }
}

impl From<CoreError> for StepError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::CorruptState { reason } => StepError::CorruptState(reason),
            other if other.is_retryable() => StepError::Transient(other.to_string()),
            other => StepError::Hard(other.to_string()),
        }
    }
}
