//! Reverse proxy forwarding.
//!
//! A request that matched the route table is rewritten and relayed to its
//! upstream:
//!
//! - the path loses the matched prefix and is joined to the upstream base path
//! - `Host` becomes the upstream authority
//! - hop-by-hop headers are stripped in both directions
//! - `X-Request-ID`, `X-Forwarded-By` and `X-Forwarded-For` are added
//!
//! The upstream's status, headers and body are relayed verbatim. Connection
//! failures and timeouts become a 502 naming the upstream; nothing is
//! retried. Dropping the response future (client disconnect) cancels the
//! upstream call.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::routing::RouteMatch;

/// Largest request body relayed upstream.
pub const MAX_PROXY_BODY_BYTES: usize = 1024 * 1024;

/// Value of the `X-Forwarded-By` marker header.
pub const FORWARDED_BY: &str = "tollgate-gateway";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Copies end-to-end headers, minus `Host` and `Content-Length` which are
/// set per hop.
fn copy_end_to_end(src: &HeaderMap) -> HeaderMap {
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}

/// Forwards matched requests to their upstreams.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client,
}

impl Forwarder {
    /// Creates a forwarder whose upstream calls time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to create proxy client: {e}")))?;
        Ok(Self { client })
    }

    /// Relays `request` to the upstream selected by `route`.
    pub async fn forward(&self, route: &RouteMatch, request: Request) -> Response {
        match self.try_forward(route, request).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn try_forward(&self, route: &RouteMatch, request: Request) -> Result<Response, GatewayError> {
        let entry = route.entry();
        let url = route.upstream_url(request.uri().query());
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES)
            .await
            .map_err(|_| GatewayError::validation("request body too large"))?;

        let mut headers = copy_end_to_end(&parts.headers);
        if let Ok(host) = HeaderValue::from_str(&entry.authority()) {
            headers.insert(header::HOST, host);
        }
        let request_id = Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        headers.insert(
            HeaderName::from_static("x-forwarded-by"),
            HeaderValue::from_static(FORWARDED_BY),
        );
        if let Some(peer) = peer {
            let forwarded_for = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{prior}, {peer}"),
                None => peer,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        debug!(
            upstream = entry.name(),
            method = %parts.method,
            url = %url,
            request_id = %request_id,
            "Proxying request"
        );

        let upstream_response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    format!("request failed: {e}")
                };
                warn!(upstream = entry.name(), request_id = %request_id, error = %e, "Proxy upstream failure");
                GatewayError::upstream(entry.name(), reason)
            })?;

        let status = upstream_response.status();
        let response_headers = copy_end_to_end(upstream_response.headers());
        debug!(upstream = entry.name(), status = status.as_u16(), "Upstream responded");

        let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}
