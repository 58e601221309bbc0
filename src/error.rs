//! # Error Types
//!
//! Crate-level error handling for the batch scheduler.
//!
//! Component-local failures (a single anchor attempt, a single parent refresh
//! call, a review settled by cancellation) have their own enums here as well,
//! since they cross the collaborator seams. Anchor and parent errors carry an
//! optional `retry_after` hint that the retry layers honor before falling back
//! to exponential backoff.

use std::time::Duration;

/// Result type for batch scheduler operations
pub type Result<T> = std::result::Result<T, MuralError>;

/// Top-level error for starting and driving a batch run
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuralError {
    /// Caller-supplied input failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or parsed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal invariant was violated; this is a programming error
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Error returned by an anchor execution attempt
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnchorExecutionError {
    #[error("anchor execution failed: {message}")]
    Failed {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The cancellation signal fired mid-attempt. Never recorded as a task
    /// failure.
    #[error("anchor execution cancelled")]
    Cancelled,
}

impl AnchorExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Failed {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

/// Error returned by a parent refresh call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParentRefreshError {
    #[error("parent refresh failed: {message}")]
    Failed {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("parent refresh cancelled")]
    Cancelled,
}

impl ParentRefreshError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Errors surfaced by the review queue
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReviewQueueError {
    /// `resolve_active` was called with nothing under review
    #[error("no review item is active")]
    NoActiveItem,

    /// The queue was cancelled; every waiter settles with this error
    #[error("review queue cancelled: {reason}")]
    Cancelled { reason: String },
}
