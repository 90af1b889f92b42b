use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    collection::CollectionError, normalization::RowDecodeError,
    state_machine::SubscriptionState,
};

/// Broad error category used for user-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid local input, unsupported state, or other configuration issue.
    Config,
    /// Session missing, expired or revoked.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the backend.
    RateLimited,
    /// Payload rejected by a server-side rule.
    Validation,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload returned by backend calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "network_failure", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, "unauthorized", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, "validation_rejected", message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: SubscriptionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while subscription is in state {current:?}"),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Validation,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// Why an optimistic mutation was rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum MutationFailure {
    /// Transient; the caller may resubmit the same payload.
    #[error("network failure: {0}")]
    NetworkFailure(BackendError),
    /// Rejected by a server-side rule; not retryable without changing input.
    #[error("validation rejected: {0}")]
    ValidationRejected(BackendError),
    /// Session invalid; re-authenticate before retrying.
    #[error("unauthorized: {0}")]
    Unauthorized(BackendError),
}

impl MutationFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }

    pub fn backend_error(&self) -> &BackendError {
        match self {
            Self::NetworkFailure(err) | Self::ValidationRejected(err) | Self::Unauthorized(err) => {
                err
            }
        }
    }

    pub fn code(&self) -> &str {
        &self.backend_error().code
    }
}

impl From<BackendError> for MutationFailure {
    fn from(err: BackendError) -> Self {
        match err.category {
            ErrorCategory::Auth => Self::Unauthorized(err),
            ErrorCategory::Validation | ErrorCategory::Config | ErrorCategory::Serialization => {
                Self::ValidationRejected(err)
            }
            ErrorCategory::Network | ErrorCategory::RateLimited | ErrorCategory::Internal => {
                Self::NetworkFailure(err)
            }
        }
    }
}

/// Errors returned while establishing a change-feed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("subscription to '{topic}' could not be established: {source}")]
    SetupFailed { topic: String, source: BackendError },
    #[error("subscription to '{topic}' rejected: {source}")]
    InvalidState { topic: String, source: BackendError },
}

impl ChannelError {
    pub fn backend_error(&self) -> &BackendError {
        match self {
            Self::SetupFailed { source, .. } | Self::InvalidState { source, .. } => source,
        }
    }
}

/// History page fetch failure; pagination state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageLoadError {
    #[error("history page {page_index} failed: {source}")]
    Fetch {
        page_index: u32,
        source: BackendError,
    },
}

impl PageLoadError {
    pub fn page_index(&self) -> u32 {
        match self {
            Self::Fetch { page_index, .. } => *page_index,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Fetch { source, .. } => &source.code,
        }
    }
}

/// Umbrella error for callers that drive several components.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Mutation(#[from] MutationFailure),
    #[error(transparent)]
    PageLoad(#[from] PageLoadError),
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ErrorCategory::RateLimited);
        assert_eq!(classify_http_status(422), ErrorCategory::Validation);
        assert_eq!(classify_http_status(503), ErrorCategory::Network);
        assert_eq!(classify_http_status(700), ErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = BackendError::invalid_state(SubscriptionState::Closed, "feed_lost");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ErrorCategory::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = BackendError::new(ErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn maps_backend_categories_to_mutation_failures() {
        assert!(matches!(
            MutationFailure::from(BackendError::network("offline")),
            MutationFailure::NetworkFailure(_)
        ));
        assert!(matches!(
            MutationFailure::from(BackendError::new(ErrorCategory::RateLimited, "r", "slow")),
            MutationFailure::NetworkFailure(_)
        ));
        assert!(matches!(
            MutationFailure::from(BackendError::validation("empty text")),
            MutationFailure::ValidationRejected(_)
        ));
        assert!(matches!(
            MutationFailure::from(BackendError::unauthorized("expired")),
            MutationFailure::Unauthorized(_)
        ));
    }

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(MutationFailure::from(BackendError::network("offline")).is_retryable());
        assert!(!MutationFailure::from(BackendError::validation("bad")).is_retryable());
        assert!(!MutationFailure::from(BackendError::unauthorized("expired")).is_retryable());
    }

    #[test]
    fn mutation_failure_exposes_stable_code() {
        let failure = MutationFailure::from(BackendError::validation("too long"));
        assert_eq!(failure.code(), "validation_rejected");
    }
}
