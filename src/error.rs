//! Error types for lock operations.
//!
//! Provides [`LockError`], a structured error enum whose variants correspond
//! one-to-one to the stable error codes in [`ErrorCode`]. Contention and
//! release/extend absence are **results**, not errors -- they never appear
//! here. Validation failures are raised before any I/O; substrate failures
//! are mapped into the transport-shaped variants by each backend.

use std::fmt;

use thiserror::Error;

/// Boxed cause attached to substrate-level failures.
pub type ErrorSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable machine-readable error codes.
///
/// Every [`LockError`] maps to exactly one code via [`LockError::code`].
/// Embedders that bridge SyncGuard errors onto their own taxonomy should
/// switch on this enum rather than on variant internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The retry loop exhausted its attempts or its deadline. Never produced
    /// by a single backend call.
    AcquisitionTimeout,
    /// The backend is unreachable; retry with external backoff.
    ServiceUnavailable,
    /// Client/transport timeout.
    NetworkTimeout,
    /// Backend throttling.
    RateLimited,
    /// Credential problem.
    AuthFailed,
    /// Key, lock ID, or TTL failed validation; also unsatisfiable size math
    /// in storage-key derivation.
    InvalidArgument,
    /// Cooperative cancellation was observed.
    Aborted,
    /// Invariant violation: fence overflow, duplicate records, unexpected
    /// substrate state.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AcquisitionTimeout => "AcquisitionTimeout",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::RateLimited => "RateLimited",
            Self::AuthFailed => "AuthFailed",
            Self::InvalidArgument => "InvalidArgument",
            Self::Aborted => "Aborted",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by lock operations.
///
/// Variants carry the context available at the failure site (`key`,
/// `lock_id`, an underlying cause). Use [`code`](LockError::code) for stable
/// programmatic matching.
#[derive(Debug, Error)]
pub enum LockError {
    /// The acquisition engine ran out of retries or wall-clock budget.
    #[error("lock acquisition timed out after {attempts} attempt(s) in {elapsed_ms} ms")]
    AcquisitionTimeout {
        /// Attempts made, including the first.
        attempts: u32,
        /// Elapsed time on the engine's monotonic clock.
        elapsed_ms: u64,
        /// The contended key, when known.
        key: Option<String>,
    },

    /// The backend could not be reached.
    #[error("backend unavailable: {message}")]
    ServiceUnavailable {
        /// Human-readable description.
        message: String,
        /// The substrate error, if available.
        #[source]
        source: Option<ErrorSource>,
    },

    /// The transport timed out before the backend answered.
    #[error("network timeout: {message}")]
    NetworkTimeout {
        /// Human-readable description.
        message: String,
        /// The substrate error, if available.
        #[source]
        source: Option<ErrorSource>,
    },

    /// The backend refused the request due to throttling.
    #[error("rate limited by backend: {message}")]
    RateLimited {
        /// Human-readable description.
        message: String,
    },

    /// Authentication or authorization against the backend failed.
    #[error("authentication failed: {message}")]
    AuthFailed {
        /// Human-readable description.
        message: String,
    },

    /// An input failed validation before any I/O was issued.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was rejected and why.
        message: String,
    },

    /// The operation observed its cancellation token.
    #[error("operation aborted by cancellation")]
    Aborted,

    /// An invariant the library relies on was violated.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
        /// The affected key, when known.
        key: Option<String>,
        /// The substrate error, if available.
        #[source]
        source: Option<ErrorSource>,
    },
}

impl LockError {
    /// Maps this error to its stable [`ErrorCode`].
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AcquisitionTimeout { .. } => ErrorCode::AcquisitionTimeout,
            Self::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            Self::NetworkTimeout { .. } => ErrorCode::NetworkTimeout,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::AuthFailed { .. } => ErrorCode::AuthFailed,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Aborted => ErrorCode::Aborted,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Builds an [`InvalidArgument`](LockError::InvalidArgument) error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Builds an [`Internal`](LockError::Internal) error without a cause.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            key: None,
            source: None,
        }
    }

    /// Builds an [`Internal`](LockError::Internal) error scoped to a key.
    pub fn internal_for_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            key: Some(key.into()),
            source: None,
        }
    }

    /// Builds a [`ServiceUnavailable`](LockError::ServiceUnavailable) error
    /// wrapping a substrate cause.
    pub fn unavailable(message: impl Into<String>, source: ErrorSource) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Rebuilds an owned copy of this error so every task awaiting a shared
    /// one-shot operation can observe its outcome. Code, message, and
    /// context fields are preserved; the boxed cause is not clonable and
    /// stays with the stored original.
    pub(crate) fn clone_shallow(&self) -> Self {
        match self {
            Self::AcquisitionTimeout {
                attempts,
                elapsed_ms,
                key,
            } => Self::AcquisitionTimeout {
                attempts: *attempts,
                elapsed_ms: *elapsed_ms,
                key: key.clone(),
            },
            Self::ServiceUnavailable { message, .. } => Self::ServiceUnavailable {
                message: message.clone(),
                source: None,
            },
            Self::NetworkTimeout { message, .. } => Self::NetworkTimeout {
                message: message.clone(),
                source: None,
            },
            Self::RateLimited { message } => Self::RateLimited {
                message: message.clone(),
            },
            Self::AuthFailed { message } => Self::AuthFailed {
                message: message.clone(),
            },
            Self::InvalidArgument { message } => Self::InvalidArgument {
                message: message.clone(),
            },
            Self::Aborted => Self::Aborted,
            Self::Internal { message, key, .. } => Self::Internal {
                message: message.clone(),
                key: key.clone(),
                source: None,
            },
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LockError>;
