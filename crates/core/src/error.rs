//! Error taxonomy shared by every reconciliation crate.
//!
//! Callers branch on the variant: validation and authorization failures are
//! reported and never retried, conflicts are retried against fresh data, and
//! configuration errors are fatal at startup.

use thiserror::Error;

use crate::records::RecordKind;

/// Result alias used throughout the library crates.
pub type Result<T> = std::result::Result<T, ReconError>;

/// Errors produced by the record store, the matching engine and the service facade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconError {
    /// Malformed or missing required input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown record id.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of record that was looked up.
        kind: RecordKind,
        /// The id that was not found.
        id: i64,
    },

    /// Status change outside the allowed state machine.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Duplicate pairing or a lost compare-and-swap.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid thresholds, weights or other startup settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No authenticated principal.
    #[error("authentication required")]
    Unauthorized,

    /// Principal lacks the permission for the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ReconError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: RecordKind, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Returns true if the operation may succeed when retried against refreshed data.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Short machine-readable code, used in API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::Configuration(_) => "configuration_error",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Storage(_) => "storage_error",
        }
    }
}
