//! Error types for outbox delivery.
//!
//! Delivery failures carry the HTTP status when one was received. The status
//! alone decides whether a failed group is retried or dead-lettered.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while claiming, delivering or settling outbox rows.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Request never produced a response.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Transport error description
        message: String,
    },

    /// Request exceeded the client timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Server rejected the request (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body
        body: String,
    },

    /// Server failed to handle the request (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body
        body: String,
    },

    /// Server asked the worker to slow down (429).
    #[error("rate limited: HTTP 429")]
    RateLimited {
        /// Response body
        body: String,
    },

    /// Response status outside the 2xx/4xx/5xx ranges.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body
        body: String,
    },

    /// Store operation failed while settling a group.
    #[error("database error: {message}")]
    DatabaseError {
        /// Store error description
        message: String,
    },

    /// Client or engine configured with unusable settings.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration problem
        message: String,
    },

    /// Background tasks did not stop within the shutdown window.
    #[error("shutdown timed out after {timeout_seconds}s")]
    ShutdownTimeout {
        /// Shutdown window in seconds
        timeout_seconds: u64,
    },

    /// A scheduling task panicked.
    #[error("{task} task panicked: {error}")]
    WorkerPanic {
        /// Name of the task
        task: &'static str,
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
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates the error matching an HTTP failure status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status_code {
            429 => Self::RateLimited { body },
            400..=499 => Self::ClientError { status_code, body },
            500..=599 => Self::ServerError { status_code, body },
            _ => Self::UnexpectedStatus { status_code, body },
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

    /// HTTP status carried by the error, if a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::UnexpectedStatus { status_code, .. } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether a group that failed with this error should be retried.
    ///
    /// A failure without a status is retryable, as is any status of 500 or
    /// above and 429. Every other status is terminal.
    pub fn is_retryable(&self) -> bool {
        match self.status_code() {
            None => true,
            Some(status) => status >= 500 || status == 429,
        }
    }

    /// Text stored on the row: the response body when there is one.
    pub fn error_text(&self) -> String {
        match self {
            Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::RateLimited { body }
            | Self::UnexpectedStatus { body, .. }
                if !body.trim().is_empty() =>
            {
                body.clone()
            },
            _ => self.to_string(),
        }
    }
}

impl From<sluice_core::CoreError> for DeliveryError {
    fn from(err: sluice_core::CoreError) -> Self {
        Self::database(err.to_string())
    }
}

/// Coarse failure kind used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No response received.
    Network,
    /// 4xx response.
    Client,
    /// 5xx response.
    Server,
    /// 429 response.
    RateLimit,
    /// Any other failure.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::UnexpectedStatus { .. }
            | DeliveryError::DatabaseError { .. }
            | DeliveryError::ConfigurationError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl ErrorCategory {
    /// Label value for metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
