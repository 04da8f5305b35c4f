//! Error taxonomy for the sync engine
//!
//! Two layers: `ApiError` classifies individual Storage API failures,
//! `RunError` covers failures that abort a whole run before a report can
//! be produced. Per-component failures are not errors in this sense; they
//! are accumulated into the run report as `SyncFailure` entries.

use thiserror::Error;

/// Failure of a single Storage API request
#[derive(Debug, Error)]
pub enum ApiError {
    /// Token rejected or insufficient permissions. Fatal for the run.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Requested object does not exist. The orchestrator treats this as
    /// "create the counterpart", not as a failure.
    #[error("not found: {0}")]
    NotFound(String),

    /// Platform throttled the request. Retried with backoff.
    #[error("rate limited by the management API")]
    RateLimited,

    /// Concurrent edit detected on the target object. Surfaced, not retried.
    #[error("conflicting edit on {0}")]
    Conflict(String),

    /// Transport-level failure (DNS, TLS, timeout, connection reset)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response (HTTP {status}): {body}")]
    Unexpected { status: u16, body: String },
}

impl ApiError {
    /// Whether the failure poisons the whole run rather than one component
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Network(_))
    }

    /// Whether a retry with backoff may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited => true,
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Unexpected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map an HTTP status + body into the taxonomy
    pub fn from_status(status: u16, body: String, what: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            404 => Self::NotFound(what.to_string()),
            409 => Self::Conflict(what.to_string()),
            429 => Self::RateLimited,
            _ => Self::Unexpected { status, body },
        }
    }
}

/// Failure that prevents a run report from being produced
#[derive(Debug, Error)]
pub enum RunError {
    /// Malformed settings (bad config URL, duplicate override, unknown
    /// mode). Raised before any network call, with the offending raw value.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Auth or network level failure that aborts the run
    #[error("connectivity failure: {0}")]
    Connectivity(#[source] ApiError),
}

impl RunError {
    /// Process exit code, matching the entrypoint contract: configuration
    /// errors exit 1, everything else exits 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Connectivity(_) => 2,
        }
    }
}
