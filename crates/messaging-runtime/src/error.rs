//! Error types for messaging operations.

use crate::lease::SettlementAction;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all messaging operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Message at position {position} does not fit in an empty batch (max: {max_size_in_bytes} bytes)")]
    Oversize {
        position: usize,
        max_size_in_bytes: usize,
    },

    #[error("Transmission to '{entity}' failed: {message}")]
    Transmission { entity: String, message: String },

    #[error("Cannot {action} message with lock token {lock_token}: {reason}")]
    Settlement {
        action: SettlementAction,
        lock_token: String,
        reason: String,
    },

    #[error("Subscription error on '{entity}': {message}")]
    Subscription { entity: String, message: String },

    #[error("Handler failed to process message {message_id}: {reason}")]
    Handler { message_id: String, reason: String },

    #[error("Session '{session_id}' is locked by another receiver")]
    SessionLocked { session_id: String },

    #[error("No unlocked session is available on '{entity}'")]
    SessionUnavailable { entity: String },

    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    /// Check if error is transient and may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Oversize { .. } => false,
            Self::Transmission { .. } => true,
            Self::Settlement { .. } => false,
            Self::Subscription { .. } => false,
            Self::Handler { .. } => false,
            Self::SessionLocked { .. } => true,
            Self::SessionUnavailable { .. } => true,
            Self::EntityNotFound { .. } => false,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Configuration(_) => false,
            Self::Serialization(_) => false,
        }
    }

    /// Check if error was caused by the message itself rather than the broker
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Oversize { .. } | Self::Serialization(_)
        )
    }

    /// Wrap any broker failure as a settlement failure for the given lease
    pub(crate) fn into_settlement(self, action: SettlementAction, lock_token: &str) -> Self {
        match self {
            settlement @ Self::Settlement { .. } => settlement,
            other => Self::Settlement {
                action,
                lock_token: lock_token.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Schema violations on an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Field '{field}' must not be empty")]
    Empty { field: String },

    #[error("Invalid type for {field}: expected {expected}")]
    InvalidType { field: String, expected: String },

    #[error("Unknown field '{field}' is not allowed")]
    UnknownField { field: String },
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Failure of a batch send after zero or more batches were already flushed.
///
/// Batches transmitted before the failure stay transmitted; nothing is
/// rolled back.
#[derive(Debug, Error)]
#[error("Batch send aborted after {transmitted_messages} message(s) in {batches_flushed} batch(es) were transmitted: {source}")]
pub struct PartialBatchError {
    /// Number of messages already accepted by the broker
    pub transmitted_messages: usize,

    /// Number of batches already accepted by the broker
    pub batches_flushed: usize,

    /// The failure that stopped the batch send
    #[source]
    pub source: MessagingError,
}

impl PartialBatchError {
    /// Discard the partial-progress counters and keep the cause
    pub fn into_inner(self) -> MessagingError {
        self.source
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
