//! Error types for modelfetch core

use modelfetch_types::{ErrorKind, TaskError};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in modelfetch core
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Client error: {status} - {message}")]
    ClientError { status: u16, message: String },

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Download URL expired ({status})")]
    UrlExpired { status: u16 },

    #[error("Transfer ended early: expected {expected} bytes, got {actual}")]
    IncompleteTransfer { expected: u64, actual: u64 },

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Max attempts exceeded ({attempts}): {last}")]
    MaxAttemptsExceeded {
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("Destination already in use: {0}")]
    DestinationConflict(PathBuf),

    #[error("Security scanner flagged file as malicious: {0}")]
    Malicious(PathBuf),

    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => !e.is_builder() && !e.is_decode(),
            FetchError::Timeout
            | FetchError::RateLimited { .. }
            | FetchError::ServerError { .. }
            | FetchError::IncompleteTransfer { .. }
            | FetchError::RangeNotSatisfiable => true,
            _ => false,
        }
    }

    /// Map onto the serializable failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            FetchError::Network(_)
            | FetchError::IncompleteTransfer { .. }
            | FetchError::RangeNotSatisfiable => ErrorKind::Network,
            FetchError::Timeout => ErrorKind::Timeout,
            FetchError::RateLimited { .. } => ErrorKind::RateLimited,
            FetchError::ClientError { .. } | FetchError::UrlExpired { .. } => {
                ErrorKind::ClientError
            }
            FetchError::ServerError { .. } => ErrorKind::ServerError,
            FetchError::HashMismatch { .. } => ErrorKind::HashMismatch,
            FetchError::Disk(_) => ErrorKind::Disk,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::MaxAttemptsExceeded { .. } => ErrorKind::MaxAttemptsExceeded,
            FetchError::DestinationConflict(_) => ErrorKind::DestinationConflict,
            FetchError::Malicious(_) => ErrorKind::Malicious,
            FetchError::Parse(_) => ErrorKind::Parse,
            FetchError::Database(_)
            | FetchError::NotFound(_)
            | FetchError::InvalidOperation(_)
            | FetchError::InvalidUrl(_) => ErrorKind::Other,
        }
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Map a reqwest failure, keeping timeouts distinct
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(error)
        }
    }

    /// Build the error for a non-success HTTP response
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, message: String) -> Self {
        let code = status.as_u16();
        if status == StatusCode::TOO_MANY_REQUESTS {
            FetchError::RateLimited { retry_after }
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE {
            FetchError::RangeNotSatisfiable
        } else if status.is_server_error() {
            FetchError::ServerError {
                status: code,
                message,
            }
        } else {
            FetchError::ClientError {
                status: code,
                message,
            }
        }
    }
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
