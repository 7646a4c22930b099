//! Typed error hierarchy for chute-dl
//!
//! Every failure the engine can surface falls into one of five kinds, and
//! the kind decides the recovery policy: `Network` retries with resume,
//! `Integrity` retries from byte zero, `Storage` and `Permanent` are
//! terminal, `Cancelled` is user-requested teardown.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connect/read failures, 5xx, 408, 429, short bodies
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// HTTP status, when the failure came from a response
        status: Option<u16>,
    },

    /// Post-download verification failures
    #[error("Integrity check failed: {}", failures.join("; "))]
    Integrity { failures: Vec<String> },

    /// Storage resolution or file-open failures
    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// 4xx (except 408/429), malformed URLs
    #[error("Permanent error: {message}")]
    Permanent { message: String },

    /// User-requested stop (or pause, internally)
    #[error("Download cancelled")]
    Cancelled,

    /// Handle not known to the engine (API misuse, not a download failure)
    #[error("Download not found: {0}")]
    NotFound(String),
}

/// Discriminant of [`DownloadError`], carried in failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Integrity,
    Storage,
    Permanent,
    Cancelled,
}

impl DownloadError {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status per the retry policy:
    /// 5xx, 408 and 429 are transient, every other 4xx is permanent.
    pub fn from_status(status: u16, context: &str) -> Self {
        if status >= 500 || status == 408 || status == 429 {
            Self::Network {
                message: format!("{}: HTTP {}", context, status),
                status: Some(status),
            }
        } else {
            Self::Permanent {
                message: format!("{}: HTTP {}", context, status),
            }
        }
    }

    /// Error kind for event payloads
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Permanent { .. } | Self::NotFound(_) => ErrorKind::Permanent,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt may succeed (resume for network faults,
    /// restart-from-zero for integrity faults)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Integrity { .. })
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(DownloadError::from_status(500, "get").kind(), ErrorKind::Network);
        assert_eq!(DownloadError::from_status(503, "get").kind(), ErrorKind::Network);
        assert_eq!(DownloadError::from_status(408, "get").kind(), ErrorKind::Network);
        assert_eq!(DownloadError::from_status(429, "get").kind(), ErrorKind::Network);
        assert_eq!(DownloadError::from_status(404, "get").kind(), ErrorKind::Permanent);
        assert_eq!(DownloadError::from_status(403, "get").kind(), ErrorKind::Permanent);
    }

    #[test]
    fn retryability() {
        assert!(DownloadError::network("reset").is_retryable());
        assert!(DownloadError::Integrity {
            failures: vec!["size mismatch".into()]
        }
        .is_retryable());
        assert!(!DownloadError::permanent("404").is_retryable());
        assert!(!DownloadError::storage("/tmp/x", "no space").is_retryable());
        assert!(!DownloadError::Cancelled.is_retryable());
    }
}
