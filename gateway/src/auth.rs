//! Bearer token authentication.
//!
//! The auth gate is a stateless request filter. A request is admitted when:
//! 1. It targets an always-public endpoint (`/health`, `/ready`, `/metrics`)
//! 2. Authentication is configured as not required
//! 3. Its `Authorization: Bearer <token>` header carries an HS256 JWT signed
//!    with the configured secret whose `exp` claim is in the future
//!
//! Anything else is rejected with 401 before reaching downstream layers.
//! Rejection is terminal; the gate never retries.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate_gateway::auth::{issue_token, AuthError, JwtVerifier};
//!
//! let verifier = JwtVerifier::new("s3cret");
//! let token = issue_token("s3cret", "alice", Duration::from_secs(60)).unwrap();
//!
//! let claims = verifier.verify(&token).unwrap();
//! assert_eq!(claims.sub.as_deref(), Some("alice"));
//!
//! let forged = issue_token("other", "mallory", Duration::from_secs(60)).unwrap();
//! assert_eq!(verifier.verify(&forged), Err(AuthError::InvalidSignature));
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::GatewayError;

/// Paths admitted without a credential.
pub const PUBLIC_PATHS: &[&str] = &["/health", "/ready", "/metrics"];

/// Returns true for endpoints that bypass auth and rate limiting.
pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

/// Reasons a bearer credential is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    /// The `Authorization` header is present but not `Bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    /// Any other decoding or validation failure.
    #[error("invalid token: {0}")]
    Invalid(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::auth(err.to_string())
    }
}

/// Claims carried by gateway bearer tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

/// HS256 token verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verifies signature and expiry, returning the decoded claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                other => AuthError::Invalid(format!("{other:?}")),
            })
    }
}

/// Signs a token for `subject` valid for `ttl`.
///
/// Used by operators and tests to mint credentials the gate accepts.
pub fn issue_token(secret: &str, subject: &str, ttl: Duration) -> Result<String, AuthError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let claims = Claims {
        sub: Some(subject.to_string()),
        exp: now + ttl.as_secs(),
        iat: Some(now),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|err| AuthError::Invalid(err.to_string()))
}

/// Extracts the token from an `Authorization` header value.
pub fn bearer_token(value: Option<&str>) -> Result<&str, AuthError> {
    let value = value.ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Admission policy shared by every request.
#[derive(Debug, Clone)]
pub struct AuthGate {
    verifier: Option<Arc<JwtVerifier>>,
    required: bool,
}

impl AuthGate {
    /// A gate that verifies tokens against `secret` when `required`.
    pub fn new(secret: Option<&str>, required: bool) -> Self {
        Self {
            verifier: secret.map(|s| Arc::new(JwtVerifier::new(s))),
            required,
        }
    }

    /// A gate that admits every request.
    pub fn disabled() -> Self {
        Self {
            verifier: None,
            required: false,
        }
    }

    /// Decides admission for a request to `path` with the given header.
    ///
    /// Returns the verified claims when a token was checked.
    pub fn admit(&self, path: &str, authorization: Option<&str>) -> Result<Option<Claims>, AuthError> {
        if is_public_path(path) || !self.required {
            return Ok(None);
        }
        let token = bearer_token(authorization)?;
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| AuthError::Invalid("no signing secret configured".to_string()))?;
        verifier.verify(token).map(Some)
    }
}

/// Middleware enforcing [`AuthGate`]. Verified claims are added to the
/// request extensions.
pub async fn auth_gate(
    State(gate): State<AuthGate>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match gate.admit(request.uri().path(), authorization) {
        Ok(Some(claims)) => {
            request.extensions_mut().insert(claims);
        }
        Ok(None) => {}
        Err(err) => {
            debug!(path = %request.uri().path(), error = %err, "Request rejected by auth gate");
            return Err(err.into());
        }
    }

    Ok(next.run(request).await)
}
