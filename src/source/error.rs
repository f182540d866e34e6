//! Source error types.

use thiserror::Error;

/// Errors from the remote repository.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The repository returned a non-success status code.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The repository returned 429 Too Many Requests.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// A response body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl SourceError {
    /// Worth retrying at project granularity
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SourceError::Api { status, .. } => *status >= 500,
            SourceError::RateLimited { .. } => true,
            SourceError::NotFound(_) | SourceError::Parse(_) | SourceError::Config(_) => false,
        }
    }
}

/// Errors writing or reading a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Someone else changed the annotation since it was read.
    #[error("checkpoint write conflict on {0}")]
    Conflict(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("checkpoint store error: {0}")]
    Store(String),
}

impl CheckpointError {
    pub fn is_conflict(&self) -> bool {
        match self {
            CheckpointError::Conflict(_) => true,
            CheckpointError::Source(SourceError::Api { status, .. }) => {
                *status == 409 || *status == 412
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = SourceError::Api {
            status: 503,
            message: String::new(),
        };
        assert!(err.is_transient());
        let err = SourceError::Api {
            status: 403,
            message: String::new(),
        };
        assert!(!err.is_transient());
        assert!(SourceError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(!SourceError::NotFound("syn1".into()).is_transient());
    }

    #[test]
    fn precondition_failures_count_as_conflicts() {
        let err = CheckpointError::from(SourceError::Api {
            status: 412,
            message: "etag mismatch".into(),
        });
        assert!(err.is_conflict());
        assert!(CheckpointError::Conflict("syn1".into()).is_conflict());
        assert!(!CheckpointError::Store("disk full".into()).is_conflict());
    }
}
