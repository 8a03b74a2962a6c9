//! Error types for the delivery engine.
//!
//! Failed HTTP attempts are recorded as data, not returned as errors: the
//! transport variants below only describe them. Errors that do propagate are
//! infrastructure faults, validation failures, or lookups that found nothing.

use std::{fmt, time::Duration};

use courier_core::{signing::SigningError, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery engine errors.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection to the receiver failed.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The receiver did not answer within the timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The receiver answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
    },

    /// The receiver answered with a 5xx or other non-2xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
    },

    /// Persistence failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid endpoint or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// A referenced entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing
        message: String,
    },

    /// The operation conflicts with current state.
    #[error("conflict: {message}")]
    Conflict {
        /// Why the operation was rejected
        message: String,
    },

    /// The payload could not be signed.
    #[error("signing failed: {0}")]
    SigningError(#[from] SigningError),

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Describes a non-2xx response.
    pub fn from_status(status_code: u16) -> Self {
        if (400..500).contains(&status_code) {
            Self::ClientError { status_code }
        } else {
            Self::ServerError { status_code }
        }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Category for logging and HTTP mapping.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }

    /// Whether this error means the engine itself is unhealthy.
    ///
    /// Such errors halt the current unit of work and are retried by the
    /// owning loop; they are never recorded as delivery outcomes.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError { .. }
                | Self::InternalError { .. }
                | Self::ShutdownTimeout { .. }
                | Self::WorkerPanic { .. }
        )
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(message) => Self::DatabaseError { message },
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::ConstraintViolation(message) => Self::Conflict { message },
            CoreError::InvalidInput(message) => Self::ConfigurationError { message },
        }
    }
}

/// Category of delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Network,
    /// 4xx responses.
    Client,
    /// 5xx and other non-2xx responses.
    Server,
    /// Persistence failures.
    Database,
    /// Invalid configuration or input.
    Configuration,
    /// Missing entities.
    NotFound,
    /// State conflicts.
    Conflict,
    /// Signing failures.
    Signing,
    /// Internal faults.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::NotFound { .. } => Self::NotFound,
            DeliveryError::Conflict { .. } => Self::Conflict,
            DeliveryError::SigningError(_) => Self::Signing,
            DeliveryError::InternalError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Signing => write!(f, "signing"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_split_into_client_and_server() {
        assert!(matches!(
            DeliveryError::from_status(404),
            DeliveryError::ClientError { status_code: 404 }
        ));
        assert!(matches!(
            DeliveryError::from_status(503),
            DeliveryError::ServerError { status_code: 503 }
        ));
        assert!(matches!(
            DeliveryError::from_status(302),
            DeliveryError::ServerError { status_code: 302 }
        ));
    }

    #[test]
    fn core_errors_keep_their_meaning() {
        let err = DeliveryError::from(CoreError::ConstraintViolation("dup".into()));
        assert_eq!(err.category(), ErrorCategory::Conflict);
        let err = DeliveryError::from(CoreError::Database("down".into()));
        assert!(err.is_infrastructure());
        let err = DeliveryError::from(CoreError::InvalidInput("bad".into()));
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(DeliveryError::from_status(500).to_string(), "server error: HTTP 500");
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
    }
}
