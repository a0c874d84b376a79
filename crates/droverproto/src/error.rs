//! Typed protocol errors.
//!
//! An invalid message produces one of these at either end and never advances
//! state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Version string is absent or the major version is unknown
    #[error("unsupported protocol version: {0:?}")]
    UnsupportedVersion(String),

    /// requestId must be a non-empty string
    #[error("requestId must be a non-empty string")]
    EmptyRequestId,

    /// Timestamp must be a finite number
    #[error("timestamp is not a finite number: {0}")]
    InvalidTimestamp(f64),

    /// Timeout must be strictly positive
    #[error("timeout must be positive, got {0}ms")]
    NonPositiveTimeout(u64),

    /// Body did not parse as a well-formed envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Short machine-readable code for logs and error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
            ProtocolError::EmptyRequestId => "empty_request_id",
            ProtocolError::InvalidTimestamp(_) => "invalid_timestamp",
            ProtocolError::NonPositiveTimeout(_) => "non_positive_timeout",
            ProtocolError::Malformed(_) => "malformed",
        }
    }
}
