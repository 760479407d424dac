//! HTTP client for the ledger service that owns transactions and blocks.
//!
//! The ledger is the source of truth for acceptance: a submission is only
//! recorded locally once the ledger has assigned it an identifier. Status
//! and block reads are passed through unchanged.
//!
//! | Operation | Ledger endpoint |
//! |-----------|-----------------|
//! | [`LedgerClient::submit_transaction`] | `POST /api/v1/transactions` |
//! | [`LedgerClient::transaction_status`] | `GET /api/v1/transactions/{id}/status` |
//! | [`LedgerClient::latest_block`] | `GET /api/v1/blocks/latest` |
//! | [`LedgerClient::block_by_number`] | `GET /api/v1/blocks/{n}` |
//!
//! Requests are never retried here; a failure is reported to the caller as
//! a gateway error.

use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// Name used for the ledger in logs and error bodies.
pub const LEDGER_NAME: &str = "ledger";

/// Errors raised when talking to the ledger.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unavailable(String),

    #[error("{path} returned {status}")]
    Status { path: String, status: u16 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        GatewayError::upstream(LEDGER_NAME, err.to_string())
    }
}

/// Client for the ledger service.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    http_client: Client,
    base_url: String,
    timeout: Duration,
}

impl LedgerClient {
    /// Creates a client for `base_url` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Configuration`] if the URL does not parse or
    /// the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| UpstreamError::Configuration(format!("invalid ledger URL: {e}")))?;

        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                UpstreamError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Submits a transaction for acceptance and returns the ledger's response.
    pub async fn submit_transaction(&self, submission: &Value) -> Result<Value, UpstreamError> {
        let path = "/api/v1/transactions";
        let request = self
            .http_client
            .post(format!("{}{path}", self.base_url))
            .json(submission);
        self.send(path, request).await
    }

    pub async fn transaction_status(&self, id: &str) -> Result<Value, UpstreamError> {
        let path = format!("/api/v1/transactions/{id}/status");
        self.get(&path).await
    }

    pub async fn latest_block(&self) -> Result<Value, UpstreamError> {
        self.get("/api/v1/blocks/latest").await
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Value, UpstreamError> {
        self.get(&format!("/api/v1/blocks/{number}")).await
    }

    async fn get(&self, path: &str) -> Result<Value, UpstreamError> {
        let request = self.http_client.get(format!("{}{path}", self.base_url));
        self.send(path, request).await
    }

    async fn send(
        &self,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, UpstreamError> {
        debug!(path, "Calling ledger");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else if e.is_connect() {
                UpstreamError::Unavailable(format!("connection failed: {e}"))
            } else {
                UpstreamError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "Ledger returned an error status");
            return Err(UpstreamError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("failed to parse body: {e}")))
    }
}

/// Identifier assigned by the ledger to an accepted submission.
///
/// Looks at `transaction_id`, then `hash`, then `id`; numbers are rendered
/// as strings. Empty strings do not count.
pub fn accepted_id(response: &Value) -> Option<String> {
    ["transaction_id", "hash", "id"].iter().find_map(|field| {
        match response.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}
