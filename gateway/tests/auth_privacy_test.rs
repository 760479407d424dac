//! Privacy tests for credentials in logs.
//!
//! Bearer tokens and the signing secret must never appear in log output,
//! even at TRACE level, whether the auth gate admits or rejects a request
//! and whether the request is handled locally or proxied upstream.
//!
//! # Test Approach
//!
//! 1. Use a custom tracing subscriber Layer to capture all log messages
//! 2. Drive requests through the full router
//! 3. Verify that sensitive data (tokens, JWTs, secrets) does NOT appear in captured logs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate_gateway::auth::issue_token;
use tollgate_gateway::config::Config;
use tollgate_gateway::routes::{create_router, AppState, Backends};
use tollgate_gateway::routing::RouteEntry;

const SECRET: &str = "privacy-test-signing-secret";

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// A buffer for capturing log output during tests.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer that captures log events for inspection.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);

        let message = format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }

    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        _id: &tracing::span::Id,
        _ctx: Context<'_, S>,
    ) {
        let mut visitor = StringVisitor::default();
        attrs.record(&mut visitor);
        self.capture
            .logs
            .lock()
            .unwrap()
            .push(format!("[span] {}: {}", attrs.metadata().name(), visitor.parts.join(" ")));
    }
}

/// A visitor that collects all event fields into a string.
#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

/// Runs an async test body with log capture at TRACE level.
///
/// Returns the captured logs for assertion.
async fn with_log_capture_async<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;

    capture.get_logs()
}

// ============================================================================
// Privacy Assertion Helpers
// ============================================================================

/// Asserts that no JWT prefix (eyJ) appears in the logs.
///
/// JWTs are base64-encoded JSON that always starts with "eyJ" because
/// the header starts with `{"`.
fn assert_no_jwt_in_logs(logs: &str, context: &str) {
    assert!(
        !logs.contains("eyJ"),
        "JWT prefix 'eyJ' found in logs during {context}!\nLogs:\n{logs}"
    );
}

/// Asserts that the given sensitive value does not appear in logs.
fn assert_sensitive_not_in_logs(logs: &str, value: &str, value_name: &str, context: &str) {
    assert!(
        !logs.contains(value),
        "{value_name} found in logs during {context}!\nValue: {value}\nLogs:\n{logs}"
    );
}

// ============================================================================
// Test Helpers
// ============================================================================

fn guarded_state(routes: Vec<RouteEntry>) -> AppState {
    let config = Config {
        jwt_secret: Some(SECRET.to_string()),
        auth_required: true,
        routes,
        ..Config::default()
    };
    AppState::new(config, Backends::in_memory()).unwrap()
}

fn request_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

// ============================================================================
// Test Cases
// ============================================================================

#[tokio::test]
async fn accepted_token_not_logged() {
    let state = guarded_state(Vec::new());
    let token = issue_token(SECRET, "alice", Duration::from_secs(300)).unwrap();

    let logs = with_log_capture_async(|| async {
        let response = create_router(state)
            .oneshot(request_with_token("/messages?address=alice&peer=bob", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    })
    .await;

    assert_no_jwt_in_logs(&logs, "admitted request");
    assert_sensitive_not_in_logs(&logs, &token, "bearer token", "admitted request");
    assert_sensitive_not_in_logs(&logs, SECRET, "signing secret", "admitted request");
}

#[tokio::test]
async fn forged_token_not_logged_on_rejection() {
    let state = guarded_state(Vec::new());
    let forged = issue_token("some-other-secret", "mallory", Duration::from_secs(300)).unwrap();

    let logs = with_log_capture_async(|| async {
        let response = create_router(state)
            .oneshot(request_with_token("/messages?address=a&peer=b", &forged))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert!(
        logs.contains("Request rejected by auth gate"),
        "rejection should still be logged\nLogs:\n{logs}"
    );
    assert_no_jwt_in_logs(&logs, "rejected request");
    assert_sensitive_not_in_logs(&logs, &forged, "forged token", "rejected request");
}

#[tokio::test]
async fn garbage_token_not_logged_on_rejection() {
    let state = guarded_state(Vec::new());
    let garbage = "eyJhbGciOiJIUzI1NiJ9.not-a-payload.invalid_signature_here";

    let logs = with_log_capture_async(|| async {
        let response = create_router(state)
            .oneshot(request_with_token("/signals", garbage))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    })
    .await;

    assert_no_jwt_in_logs(&logs, "malformed token rejection");
    assert_sensitive_not_in_logs(&logs, "invalid_signature_here", "token signature", "malformed token rejection");
}

#[tokio::test]
async fn proxied_token_reaches_upstream_but_not_logs() {
    let upstream = MockServer::start().await;
    let token = issue_token(SECRET, "bob", Duration::from_secs(300)).unwrap();
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;
    let state = guarded_state(vec![RouteEntry::new("/accounts", &upstream.uri()).unwrap()]);

    let logs = with_log_capture_async(|| async {
        let response = create_router(state)
            .oneshot(request_with_token("/accounts/profile", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    })
    .await;

    assert!(
        logs.contains("Proxying request"),
        "proxy path should be logged\nLogs:\n{logs}"
    );
    assert_no_jwt_in_logs(&logs, "proxied request");
    assert_sensitive_not_in_logs(&logs, &token, "bearer token", "proxied request");
}
