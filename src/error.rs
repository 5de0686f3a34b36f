//! Unified error type for the engine.
//!
//! Every failure crossing a module boundary is classified into one of five
//! kinds. The `retryable` flag on [`EngineError::Upstream`] drives the
//! retry loops in the router and providers; all other kinds are final.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Malformed or invalid input: bad parameters, non-UTF-8 bodies,
    /// unknown schema names, oversized embedding items.
    #[error("invalid data: {0}")]
    Data(String),

    /// An embedding vector did not match the configured dimensionality.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A request combined mutually exclusive capability triggers.
    #[error("conflicting request: {0}")]
    Conflict(String),

    /// A remote dependency failed. `retryable` marks transient failures
    /// (timeouts, rate limits, 5xx) that backoff loops may retry.
    #[error("upstream failure: {detail}")]
    Upstream { detail: String, retryable: bool },

    /// The caller cancelled the operation before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn data(detail: impl Into<String>) -> Self {
        Self::Data(detail.into())
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict(detail.into())
    }

    /// Non-retryable upstream failure.
    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::Upstream {
            detail: detail.into(),
            retryable: false,
        }
    }

    /// Transient upstream failure eligible for retry.
    pub fn upstream_transient(detail: impl Into<String>) -> Self {
        Self::Upstream {
            detail: detail.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { retryable: true, .. })
    }

    /// Stable label for logs and serialized outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Conflict(_) => "conflict",
            Self::Upstream { .. } => "upstream",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        let retryable = e.is_timeout() || e.is_connect() || e.is_request();
        Self::Upstream {
            detail: e.to_string(),
            retryable,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        Self::Upstream {
            detail: format!("database error: {e}"),
            retryable: false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Data(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_only_for_transient_upstream() {
        assert!(EngineError::upstream_transient("timeout").is_retryable());
        assert!(!EngineError::upstream("bad request").is_retryable());
        assert!(!EngineError::data("nope").is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }

    #[test]
    fn kind_labels_stable() {
        assert_eq!(EngineError::data("x").kind(), "data");
        assert_eq!(
            EngineError::DimensionMismatch {
                expected: 4,
                got: 8
            }
            .kind(),
            "dimension_mismatch"
        );
        assert_eq!(EngineError::conflict("x").kind(), "conflict");
        assert_eq!(EngineError::upstream("x").kind(), "upstream");
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn display_includes_detail() {
        let e = EngineError::upstream("service unavailable");
        assert!(e.to_string().contains("service unavailable"));
    }
}
