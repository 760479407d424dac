//! Prometheus metrics.
//!
//! One [`Metrics`] value owns a private registry, so several gateways (or
//! tests) in one process never collide. Exposed at `GET /metrics` in the
//! Prometheus text format:
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `tollgate_http_requests_total` | `route`, `method`, `status` |
//! | `tollgate_http_request_duration_seconds` | `route` |
//! | `tollgate_rate_limited_total` | `route` |
//! | `tollgate_rate_limit_fallbacks_total` | |
//! | `tollgate_worker_outcomes_total` | `outcome` |
//!
//! Route labels are route templates or proxy prefixes, never raw paths.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::routing::RouteTable;

/// Gateway counters and histograms.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    request_duration: HistogramVec,
    rate_limited: IntCounterVec,
    limiter_fallbacks: IntCounter,
    worker_outcomes: IntCounterVec,
}

impl Metrics {
    /// Creates and registers every metric.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("tollgate_http_requests_total", "HTTP requests by route and status"),
            &["route", "method", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "tollgate_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["route"],
        )?;
        let rate_limited = IntCounterVec::new(
            Opts::new("tollgate_rate_limited_total", "Requests rejected by the rate limiter"),
            &["route"],
        )?;
        let limiter_fallbacks = IntCounter::new(
            "tollgate_rate_limit_fallbacks_total",
            "Rate limit checks decided without the shared counter store",
        )?;
        let worker_outcomes = IntCounterVec::new(
            Opts::new("tollgate_worker_outcomes_total", "Queue items handled, by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(limiter_fallbacks.clone()))?;
        registry.register(Box::new(worker_outcomes.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            rate_limited,
            limiter_fallbacks,
            worker_outcomes,
        })
    }

    pub fn observe_request(&self, route: &str, method: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.requests
            .with_label_values(&[route, method, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[route])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_rate_limited(&self, route: &str) {
        self.rate_limited.with_label_values(&[route]).inc();
    }

    pub fn record_limiter_fallback(&self) {
        self.limiter_fallbacks.inc();
    }

    /// Counts one handled queue item; `outcome` is one of `processed`,
    /// `requeued`, `dropped` or `malformed`.
    pub fn record_worker_outcome(&self, outcome: &str) {
        self.worker_outcomes.with_label_values(&[outcome]).inc();
    }

    /// Current value of a worker outcome counter.
    pub fn worker_outcome_count(&self, outcome: &str) -> u64 {
        self.worker_outcomes.with_label_values(&[outcome]).get()
    }

    /// Encodes every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, GatewayError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| GatewayError::internal(format!("metrics encoding failed: {err}")))?;
        String::from_utf8(buffer)
            .map_err(|err| GatewayError::internal(format!("metrics encoding failed: {err}")))
    }
}

/// State for [`track_requests`].
#[derive(Clone)]
pub struct RequestMetrics {
    pub metrics: Metrics,
    pub routes: Arc<RouteTable>,
}

/// Middleware counting every response by route, method and status.
pub async fn track_requests(
    State(tracker): State<RequestMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let route = tracker.routes.identity(
        request.extensions().get::<MatchedPath>().map(MatchedPath::as_str),
        request.uri().path(),
    );
    let method = request.method().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    tracker.metrics.observe_request(
        &route,
        method.as_str(),
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_request("/transactions", "POST", 200, Duration::from_millis(12));
        metrics.record_rate_limited("/messages");
        metrics.record_limiter_fallback();
        metrics.record_worker_outcome("dropped");

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"tollgate_http_requests_total{method="POST",route="/transactions",status="200"} 1"#
        ));
        assert!(text.contains(r#"tollgate_rate_limited_total{route="/messages"} 1"#));
        assert!(text.contains("tollgate_rate_limit_fallbacks_total 1"));
        assert!(text.contains(r#"tollgate_worker_outcomes_total{outcome="dropped"} 1"#));
        assert!(text.contains("tollgate_http_request_duration_seconds_bucket"));
    }

    #[test]
    fn instances_do_not_share_counters() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_worker_outcome("processed");
        assert_eq!(first.worker_outcome_count("processed"), 1);
        assert_eq!(second.worker_outcome_count("processed"), 0);
    }
}
