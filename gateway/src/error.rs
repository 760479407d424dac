//! Error types for the Tollgate gateway.
//!
//! This module defines the top-level error returned by request handlers and
//! middleware, and its mapping onto HTTP responses.
//!
//! # Error Types
//!
//! - [`GatewayError`] - Every failure that can reach a client
//! - [`ConfigError`](crate::config::ConfigError) - Configuration loading failures
//!
//! Every rejected request is rendered as a JSON body of the form
//! `{"error": "<message>"}` with a status drawn from the table below:
//!
//! | Variant | Status |
//! |---------|--------|
//! | `Validation` | 400 |
//! | `Auth` | 401 |
//! | `NotFound` | 404 |
//! | `RateLimit` | 429 (+ `Retry-After`) |
//! | `Upstream` | 502 |
//! | `Unavailable` | 503 |
//! | `Internal`, `Config` | 500 |
//!
//! # Example
//!
//! ```rust
//! use tollgate_gateway::error::GatewayError;
//!
//! fn parse_block(raw: &str) -> Result<u64, GatewayError> {
//!     raw.parse()
//!         .map_err(|_| GatewayError::validation("invalid block number"))
//! }
//!
//! assert!(parse_block("12").is_ok());
//! assert!(parse_block("twelve").is_err());
//! ```

use std::error::Error;
use std::fmt;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::ConfigError;

/// Top-level error type for the gateway.
///
/// # Error Categories
///
/// - **Admission errors**: authentication and rate limiting, terminal per request
/// - **Validation errors**: malformed request bodies or parameters
/// - **Upstream errors**: a proxied or owning service failed or is unreachable
/// - **Dependency errors**: a backing store needed to serve the request is down
/// - **Internal errors**: unexpected failures, never described to the client
#[derive(Debug)]
pub enum GatewayError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// Missing, malformed, expired or wrongly signed bearer credential.
    Auth(String),

    /// Request body or parameters failed validation.
    Validation(String),

    /// The addressed resource does not exist.
    NotFound(String),

    /// Rate limit exceeded.
    ///
    /// The `retry_after` field is the number of seconds until the current
    /// fixed window rolls over.
    RateLimit {
        /// Identifier for the rate-limited client.
        client: String,
        /// Number of seconds until the window resets.
        retry_after: u64,
    },

    /// An upstream service failed, timed out or was unreachable.
    Upstream {
        /// Name of the upstream that failed.
        upstream: String,
        /// What went wrong.
        message: String,
    },

    /// A dependency needed to serve the request is unavailable.
    Unavailable(String),

    /// Unexpected internal error.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(msg) => write!(f, "unauthorized: {msg}"),
            Self::Validation(msg) => write!(f, "invalid request: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::RateLimit {
                client,
                retry_after,
            } => write!(
                f,
                "rate limit exceeded for {client}, retry after {retry_after} seconds"
            ),
            Self::Upstream { upstream, message } => {
                write!(f, "upstream {upstream} error: {message}")
            }
            Self::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for GatewayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl GatewayError {
    /// Creates a new authentication error.
    ///
    /// ```rust
    /// use tollgate_gateway::error::GatewayError;
    ///
    /// let err = GatewayError::auth("missing bearer token");
    /// assert!(matches!(err, GatewayError::Auth(_)));
    /// ```
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a new rate limit error.
    ///
    /// ```rust
    /// use tollgate_gateway::error::GatewayError;
    ///
    /// let err = GatewayError::rate_limit("10.0.0.7", 42);
    /// assert!(matches!(err, GatewayError::RateLimit { retry_after: 42, .. }));
    /// ```
    pub fn rate_limit(client: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            client: client.into(),
            retry_after,
        }
    }

    /// Creates a new upstream error naming the upstream that failed.
    pub fn upstream(upstream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            message: message.into(),
        }
    }

    /// Creates a new dependency-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::Validation(_) | Self::NotFound(_) | Self::RateLimit { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Message exposed to the client.
    ///
    /// Internal and configuration errors are replaced by a generic message;
    /// their detail only goes to the log.
    fn public_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Config(_) => "internal server error".to_string(),
            Self::RateLimit { .. } => "rate limit exceeded".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error message.
    pub error: String,
}

impl ErrorBody {
    /// Creates a new error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_server_error() && !matches!(self, Self::Upstream { .. }) {
            error!(error = %self, status = status.as_u16(), "Request failed");
        }

        let body = Json(ErrorBody::new(self.public_message()));
        match self {
            Self::RateLimit { retry_after, .. } => (
                status,
                [(header::RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
