//! Classified error types for outbound calls.
//!
//! Every failure produced by the token layer or the request executor is a
//! [`ClassifiedError`] tagged with an [`ErrorKind`]. The kind is the only
//! thing the retry policy looks at when deciding what happens next.

use std::fmt;
use thiserror::Error;

/// Stable error codes attached to [`ClassifiedError`].
///
/// Identity provider errors keep the provider's own `error` value
/// (`invalid_client`, `invalid_grant`, ...) instead of these.
pub mod codes {
    /// Request exceeded a connect/read/write timeout.
    pub const TIMEOUT: &str = "timeout";
    /// TCP/TLS connection could not be established.
    pub const CONNECTION_FAILED: &str = "connection_failed";
    /// Any other transport failure.
    pub const NETWORK_ERROR: &str = "network_error";
    /// Downstream answered with a non-success status.
    pub const UPSTREAM_STATUS: &str = "upstream_status";
    /// Downstream rejected the credentials.
    pub const UNAUTHORIZED: &str = "un_auth";
    /// Connection pool limits reached.
    pub const POOL_EXHAUSTED: &str = "pool_exhausted";
    /// Response body could not be decoded.
    pub const UN_DESERIALIZE: &str = "un_deserialize";
    /// Identity provider rejected the client credentials.
    pub const INVALID_CLIENT: &str = "invalid_client";
    /// Identity provider failed without a structured error body.
    pub const TOKEN_ENDPOINT_ERROR: &str = "token_endpoint_error";
    /// Caller cancelled the call.
    pub const CANCELLED: &str = "cancelled";
    /// Caller deadline elapsed.
    pub const DEADLINE_EXCEEDED: &str = "deadline_exceeded";
    /// Profile is not usable for the requested operation.
    pub const INVALID_PROFILE: &str = "invalid_profile";
    /// Request could not be built.
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// Background task failed unexpectedly.
    pub const INTERNAL: &str = "internal_error";
}

/// Retry-relevant category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Network, 5xx or timeout. Retryable within policy.
    Transient,
    /// Permanent credential or configuration error. Never retried.
    Unretryable,
    /// Credentials rejected. Retried at most once via a forced token refresh.
    Auth,
}

impl ErrorKind {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Unretryable => "unretryable",
            Self::Auth => "auth",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure tagged with its retry category.
///
/// Cloneable so that a single token fetch failure can be delivered to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {code}: {message}")]
pub struct ClassifiedError {
    /// Retry category
    pub kind: ErrorKind,
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Message parameters (destination name first when known)
    pub params: Vec<String>,
    /// HTTP status that produced the error, if any
    pub status: Option<u16>,
    auth_retried: bool,
}

impl ClassifiedError {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            params: Vec::new(),
            status: None,
            auth_retried: false,
        }
    }

    /// Create a transient error.
    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, code, message)
    }

    /// Create an unretryable error.
    #[must_use]
    pub fn unretryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unretryable, code, message)
    }

    /// Create an authentication error.
    #[must_use]
    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, code, message)
    }

    /// Create the error returned when the caller cancels a call.
    #[must_use]
    pub fn cancelled(destination: &str) -> Self {
        Self::unretryable(codes::CANCELLED, "call cancelled by caller").with_param(destination)
    }

    /// Create the error returned when the caller deadline elapses.
    #[must_use]
    pub fn deadline_exceeded(destination: &str) -> Self {
        Self::unretryable(codes::DEADLINE_EXCEEDED, "call deadline exceeded")
            .with_param(destination)
    }

    /// Append a message parameter.
    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Attach the HTTP status that caused the failure.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Mark an `Auth` error as already having used its one forced refresh.
    #[must_use]
    pub const fn mark_auth_retried(mut self) -> Self {
        self.auth_retried = true;
        self
    }

    /// Whether the forced refresh for this `Auth` error has been spent.
    #[must_use]
    pub const fn auth_retried(&self) -> bool {
        self.auth_retried
    }

    /// Whether the error is transient.
    ///
    /// # Examples
    ///
    /// ```
    /// use resilient_client::ClassifiedError;
    ///
    /// let err = ClassifiedError::transient("timeout", "read timed out");
    /// assert!(err.is_retryable());
    ///
    /// let err = ClassifiedError::unretryable("invalid_client", "bad secret");
    /// assert!(!err.is_retryable());
    /// ```
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Classify a transport failure reported by reqwest.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error, destination: &str) -> Self {
        let classified = if err.is_timeout() {
            Self::transient(codes::TIMEOUT, err.to_string())
        } else if err.is_connect() {
            Self::transient(codes::CONNECTION_FAILED, err.to_string())
        } else if err.is_builder() {
            Self::unretryable(codes::INVALID_REQUEST, err.to_string())
        } else if err.is_decode() {
            Self::unretryable(codes::UN_DESERIALIZE, err.to_string())
        } else {
            Self::transient(codes::NETWORK_ERROR, err.to_string())
        };
        classified.with_param(destination)
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The underlying configuration source failed
    #[error("Failed to load configuration: {0}")]
    Source(#[from] config::ConfigError),

    /// A profile address or endpoint is not a valid absolute URL
    #[error("Invalid URL for {profile}.{field}: {reason}")]
    InvalidUrl {
        /// Profile name
        profile: String,
        /// Offending field
        field: String,
        /// Parser message
        reason: String,
    },

    /// A value is outside its allowed range
    #[error("Invalid value for {profile}.{field}: {reason}")]
    InvalidValue {
        /// Profile name
        profile: String,
        /// Offending field
        field: String,
        /// What is wrong
        reason: String,
    },

    /// A required block or field is absent
    #[error("Missing required configuration {field} for profile {profile}")]
    MissingRequired {
        /// Profile name
        profile: String,
        /// Missing field
        field: String,
    },

    /// Two profiles share a name
    #[error("Duplicate client profile name: {0}")]
    DuplicateProfile(String),
}

impl From<ConfigError> for ClassifiedError {
    fn from(err: ConfigError) -> Self {
        Self::unretryable(codes::INVALID_PROFILE, err.to_string())
    }
}
