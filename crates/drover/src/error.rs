//! Dispatch error taxonomy.
//!
//! Every terminal dispatch outcome other than success is one of these. The
//! queue consults [`DispatchError::is_retryable`] to decide whether an
//! attempt re-enters backoff; everything else is final for the request.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Malformed dispatch or message. Surfaced synchronously, never retried.
    #[error("invalid dispatch: {0}")]
    Validation(String),

    /// Worker error, channel glitch, or per-task timeout. Retried by the
    /// queue subject to the attempt ceiling.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retries exhausted; carries the last attempt's error.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The dispatch deadline elapsed. Any in-flight attempt is abandoned.
    #[error("dispatch deadline exceeded after {elapsed_ms}ms")]
    Deadline { elapsed_ms: u64 },

    /// Cancelled by the caller. Discriminated from Deadline.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// No suitable execution target. Fatal to this request only.
    #[error("no suitable execution target: {0}")]
    Routing(String),

    /// Supervisor or pool is shutting down.
    #[error("shutting down: {reason}")]
    Shutdown { reason: String },
}

/// Discriminant for metrics and match-free classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Transient,
    Exhausted,
    Deadline,
    Cancelled,
    Routing,
    Shutdown,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::Transient(_) => ErrorKind::Transient,
            DispatchError::Exhausted { .. } => ErrorKind::Exhausted,
            DispatchError::Deadline { .. } => ErrorKind::Deadline,
            DispatchError::Cancelled { .. } => ErrorKind::Cancelled,
            DispatchError::Routing(_) => ErrorKind::Routing,
            DispatchError::Shutdown { .. } => ErrorKind::Shutdown,
        }
    }

    /// Only transient failures re-enter the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        DispatchError::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        DispatchError::Shutdown {
            reason: reason.into(),
        }
    }
}
