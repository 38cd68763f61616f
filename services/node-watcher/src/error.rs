//! Error types surfaced by the cluster API adapter and the stream relay.
//!
//! Every failure the cluster API can produce is folded into one of four
//! kinds so callers can branch on [`ApiError::kind`] instead of matching on
//! message text.

use reqwest::StatusCode;
use thiserror::Error;

/// Coarse classification of a cluster API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// The control plane could not be reached or the connection broke.
    Network,
    /// The node, allocation, task or file does not exist.
    NotFound,
    /// The request was rejected by ACLs.
    Permission,
    /// The response could not be decoded.
    MalformedResponse,
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiErrorKind::Network => write!(f, "network"),
            ApiErrorKind::NotFound => write!(f, "not_found"),
            ApiErrorKind::Permission => write!(f, "permission"),
            ApiErrorKind::MalformedResponse => write!(f, "malformed_response"),
        }
    }
}

/// Errors returned by the cluster API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ApiError {
    /// Classification of this error.
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Network(_) => ApiErrorKind::Network,
            ApiError::NotFound(_) => ApiErrorKind::NotFound,
            ApiError::Permission(_) => ApiErrorKind::Permission,
            ApiError::MalformedResponse(_) => ApiErrorKind::MalformedResponse,
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.trim().is_empty() {
            status.to_string()
        } else {
            format!("{} - {}", status, body.trim())
        };

        match status {
            StatusCode::NOT_FOUND => ApiError::NotFound(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Permission(detail),
            s if s.is_server_error() => ApiError::Network(detail),
            _ => ApiError::MalformedResponse(detail),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status, "")
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::MalformedResponse(err.to_string())
    }
}

/// Errors returned by the stream relay helpers.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The stream failed part way through a size measurement.
    #[error("stream failed after {bytes_read} bytes: {source}")]
    Transport {
        bytes_read: u64,
        #[source]
        source: ApiError,
    },

    /// The stream failed before producing a frame.
    #[error(transparent)]
    Stream(#[from] ApiError),

    /// The stream closed cleanly without producing a frame.
    #[error("stream closed before any frame arrived")]
    Empty,
}

impl RelayError {
    /// The underlying API error, if any.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            RelayError::Transport { source, .. } => Some(source),
            RelayError::Stream(e) => Some(e),
            RelayError::Empty => None,
        }
    }
}
