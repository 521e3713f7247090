//! Error types for the dispatch core
//!
//! Rate-limit rejections never appear here: they are absorbed by requeueing.
//! Every other failure reaches the caller exactly once as an [`ApiError`].

use crate::bucket::RouteError;
use crate::endpoints::ValidationError;
use bytes::Bytes;
use std::time::Duration;

/// Boxed error used for transport-specific failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of the underlying HTTP transport. Never retried by the dispatcher.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The call did not complete within the transport's deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Connecting to or talking with the remote host failed.
    #[error("connection error: {0}")]
    Connection(String),
    /// A response arrived but could not be read as HTTP.
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Other(BoxError),
}

/// Error delivered to the submitter of a request.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    /// The service answered with a non-429 4xx/5xx status.
    #[error("remote rejected request with status {status}")]
    RemoteRejection {
        /// HTTP status code.
        status: u16,
        /// Raw response body (usually a JSON error object).
        body: Bytes,
    },
    /// The request was withdrawn from its queue before dispatch.
    #[error("request cancelled before dispatch")]
    Cancelled,
    /// The dispatcher was dropped while the request was still queued.
    #[error("dispatcher shut down before the request completed")]
    Shutdown,
    #[error("invalid route: {0}")]
    Route(#[from] RouteError),
    /// Request options were rejected before anything was queued.
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not decode response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Whether a caller-side retry could plausibly succeed.
    ///
    /// Timeouts, connection failures and 5xx responses are transient; client
    /// errors (4xx), cancellations and local errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(TransportError::Timeout(_))
            | ApiError::Transport(TransportError::Connection(_)) => true,
            ApiError::Transport(_) => false,
            ApiError::RemoteRejection { status, .. } => *status >= 500,
            ApiError::Cancelled
            | ApiError::Shutdown
            | ApiError::Route(_)
            | ApiError::Validation(_)
            | ApiError::Decode(_) => false,
        }
    }

    /// HTTP status of a remote rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RemoteRejection { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

/// Scope of a 429 rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// Only the bucket that was called is exhausted.
    Route,
    /// Every bucket must pause.
    Global,
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitScope::Route => f.write_str("route"),
            RateLimitScope::Global => f.write_str("global"),
        }
    }
}

/// A 429 as understood by the dispatcher. Internal: resolved by requeueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RateLimited {
    pub(crate) scope: RateLimitScope,
    pub(crate) retry_after: Duration,
}
