//! # Change Feed Errors
//!
//! Error taxonomy for feeds and the transport session that carries them.

use thiserror::Error;

use super::mode::DispatchMode;

/// Result type for change feed operations
pub type FeedResult<T> = Result<T, FeedError>;

/// Change feed errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    // ==================
    // Consumer Errors
    // ==================
    /// Pull and push disciplines were both attempted on one feed
    #[error("Feed is in {current} mode, {operation} is not allowed")]
    ModeConflict {
        current: DispatchMode,
        operation: String,
    },

    /// Feed is closed
    #[error("Feed closed")]
    FeedClosed,

    // ==================
    // Server Errors
    // ==================
    /// Watched table was dropped or invalidated server-side
    #[error("Resource gone: {0}")]
    ResourceGone(String),

    /// Query rejected by the server
    #[error("Query failed: {0}")]
    Query(String),

    // ==================
    // Transport Errors
    // ==================
    /// Connection unusable and re-establishment failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Request did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedError {
    /// Build a mode conflict error
    pub fn mode_conflict(current: DispatchMode, operation: impl Into<String>) -> Self {
        FeedError::ModeConflict {
            current,
            operation: operation.into(),
        }
    }

    /// Returns true if retrying the operation may succeed.
    ///
    /// Each operation re-probes the connection, so transport failures never
    /// poison later attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::ConnectionError(_) | FeedError::Timeout(_))
    }

    /// Returns true for conditions that end a feed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedError::FeedClosed | FeedError::ResourceGone(_) | FeedError::ConnectionError(_)
        )
    }

    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::ModeConflict { .. } => "FEED_MODE_CONFLICT",
            FeedError::FeedClosed => "FEED_CLOSED",
            FeedError::ResourceGone(_) => "FEED_RESOURCE_GONE",
            FeedError::Query(_) => "FEED_QUERY_ERROR",
            FeedError::ConnectionError(_) => "FEED_CONNECTION_ERROR",
            FeedError::Timeout(_) => "FEED_TIMEOUT",
            FeedError::Config(_) => "FEED_CONFIG_ERROR",
            FeedError::Internal(_) => "FEED_INTERNAL_ERROR",
        }
    }
}
