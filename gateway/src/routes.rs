//! HTTP routes for the Tollgate gateway.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST /transactions` | submit to the ledger, then record and queue |
//! | `GET /transactions/{id}/status` | ledger status read |
//! | `GET /transactions/{id}/pipeline` | local pipeline record |
//! | `GET /blocks/latest`, `GET /blocks/{number}` | ledger block reads |
//! | `POST /messages`, `GET /messages` | chat messages |
//! | `POST /messages/{id}/anchor` | anchor a message at a block |
//! | `POST /signals` | publish a peer signal |
//! | `GET /stream/messages`, `GET /stream/signals` | SSE streams |
//! | `GET /health`, `GET /ready`, `GET /metrics` | always public |
//! | anything else | reverse proxied per the route table |
//!
//! Every request passes the auth gate, then the rate limiter, before it
//! reaches a handler or the proxy.
//!
//! # Example
//!
//! ```rust,no_run
//! use tollgate_gateway::config::Config;
//! use tollgate_gateway::routes::{create_router, AppState, Backends};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config, Backends::in_memory()).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::{auth_gate, AuthGate};
use crate::broadcast::{publish_or_log, EventHub, EventPublisher};
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::intake::Intake;
use crate::metrics::{track_requests, Metrics, RequestMetrics};
use crate::proxy::Forwarder;
use crate::queue::{MemoryQueue, WorkQueue};
use crate::rate_limit::{rate_limit_gate, CounterStore, MemoryCounterStore, RateLimitGate, RateLimiter};
use crate::routing::RouteTable;
use crate::store::{MemoryStore, MessageStore, TransactionStore};
use crate::stream::sse_response;
use crate::types::{
    signal_channel, AnchorOutcome, Envelope, MessageNotice, MessageQuery, NewMessage,
    SignalEnvelope, MESSAGES_CHANNEL,
};
use crate::upstream::{accepted_id, LedgerClient, LEDGER_NAME};

/// Maximum JSON body size (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Default page size of `GET /messages`.
pub const DEFAULT_MESSAGE_LIMIT: usize = 100;

/// Largest page size of `GET /messages`.
pub const MAX_MESSAGE_LIMIT: usize = 1000;

// ============================================================================
// Application State
// ============================================================================

/// Storage, queue and fan-out backends behind the handlers.
#[derive(Clone)]
pub struct Backends {
    pub transactions: Arc<dyn TransactionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub counters: Arc<dyn CounterStore>,
    /// Local fan-out hub that stream handlers subscribe to.
    pub hub: EventHub,
    /// Where handlers publish envelopes; the hub itself in a single process.
    pub publisher: Arc<dyn EventPublisher>,
}

impl Backends {
    /// Process-local backends; nothing is shared between instances.
    pub fn in_memory() -> Self {
        let store = MemoryStore::new();
        let hub = EventHub::new();
        Self {
            transactions: Arc::new(store.clone()),
            messages: Arc::new(store),
            queue: Arc::new(MemoryQueue::new()),
            counters: Arc::new(MemoryCounterStore::new()),
            publisher: Arc::new(hub.clone()),
            hub,
        }
    }
}

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub routes: Arc<RouteTable>,
    pub auth: AuthGate,
    pub rate_limiter: RateLimiter,
    pub ledger: LedgerClient,
    pub forwarder: Forwarder,
    pub intake: Intake,
    pub transactions: Arc<dyn TransactionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub hub: EventHub,
    pub publisher: Arc<dyn EventPublisher>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

impl AppState {
    /// Builds the state from configuration and backends.
    ///
    /// # Errors
    ///
    /// Fails when the ledger URL is invalid, an HTTP client cannot be built
    /// or the metrics registry rejects a metric.
    pub fn new(config: Config, backends: Backends) -> Result<Self> {
        let ledger = LedgerClient::new(config.ledger_url.clone(), config.upstream_timeout)?;
        let forwarder = Forwarder::new(config.upstream_timeout)?;
        let metrics = Metrics::new()
            .map_err(|err| GatewayError::internal(format!("metrics registry: {err}")))?;
        let rate_limiter = RateLimiter::new(
            backends.counters,
            config.rate_limit_rpm,
            config.rate_limit_fallback,
        )
        .with_metrics(metrics.clone());
        let auth = AuthGate::new(config.jwt_secret.as_deref(), config.auth_required);

        Ok(Self {
            routes: Arc::new(RouteTable::from_entries(config.routes.clone())),
            config: Arc::new(config),
            auth,
            rate_limiter,
            ledger,
            forwarder,
            intake: Intake::new(backends.transactions.clone(), backends.queue.clone()),
            transactions: backends.transactions,
            messages: backends.messages,
            queue: backends.queue,
            hub: backends.hub,
            publisher: backends.publisher,
            metrics,
            start_time: Instant::now(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes", &self.routes)
            .field("ledger", &self.ledger.base_url())
            .field("hub", &self.hub)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let rate_gate = RateLimitGate {
        limiter: state.rate_limiter.clone(),
        routes: state.routes.clone(),
        trust_forwarded_for: state.config.trust_forwarded_for,
    };
    let auth = state.auth.clone();
    let request_metrics = RequestMetrics {
        metrics: state.metrics.clone(),
        routes: state.routes.clone(),
    };
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(get_health))
        .route("/ready", get(get_ready))
        .route("/metrics", get(get_metrics))
        .route("/transactions", post(post_transaction))
        .route("/transactions/{id}/status", get(get_transaction_status))
        .route("/transactions/{id}/pipeline", get(get_transaction_pipeline))
        .route("/blocks/latest", get(get_latest_block))
        .route("/blocks/{number}", get(get_block))
        .route("/messages", post(post_message).get(get_messages))
        .route("/messages/{id}/anchor", post(post_anchor))
        .route("/signals", post(post_signal))
        .route("/stream/messages", get(stream_messages))
        .route("/stream/signals", get(stream_signals))
        .fallback(proxy_request)
        .layer(from_fn_with_state(rate_gate, rate_limit_gate))
        .layer(from_fn_with_state(auth, auth_gate))
        .layer(from_fn_with_state(request_metrics, track_requests))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============================================================================
// Extractors
// ============================================================================

/// `Json` whose rejection is rendered as a gateway validation error.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(&rejection)),
        }
    }
}

fn json_rejection(rejection: &JsonRejection) -> GatewayError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::validation("request body too large")
    } else {
        GatewayError::validation(rejection.body_text())
    }
}

/// `Query` whose rejection is rendered as a gateway validation error.
pub struct QueryParams<T>(pub T);

impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(query_rejection(&rejection)),
        }
    }
}

fn query_rejection(rejection: &QueryRejection) -> GatewayError {
    GatewayError::validation(rejection.body_text())
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::validation(format!("{field} is required")));
    }
    Ok(())
}

// ============================================================================
// Health
// ============================================================================

/// Response body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    /// Open stream connections on this instance.
    pub stream_subscribers: usize,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stream_subscribers: state.hub.subscriber_count(),
    })
}

/// GET /ready - 200 when the durable store and the work queue answer.
async fn get_ready(State(state): State<AppState>) -> Result<Json<Value>> {
    if let Err(err) = state.transactions.ping().await {
        debug!(error = %err, "Readiness check failed on durable store");
        return Err(GatewayError::unavailable("durable store unavailable"));
    }
    if let Err(err) = state.queue.ping().await {
        debug!(error = %err, "Readiness check failed on work queue");
        return Err(GatewayError::unavailable("work queue unavailable"));
    }
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

/// GET /metrics - Prometheus text exposition.
async fn get_metrics(State(state): State<AppState>) -> Result<Response> {
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}

// ============================================================================
// Transactions and blocks
// ============================================================================

/// POST /transactions - Submit a transaction.
///
/// The ledger must accept the submission first. Only then is the pending
/// record written and the work item queued; failures of those two steps are
/// logged and do not fail the request.
///
/// # Responses
///
/// - `200 OK` - the ledger's response, with `transaction_id` filled in
/// - `400 Bad Request` - body is not a JSON object
/// - `502 Bad Gateway` - the ledger failed, rejected the submission, or
///   returned no identifier
async fn post_transaction(
    State(state): State<AppState>,
    JsonBody(submission): JsonBody<Value>,
) -> Result<Json<Value>> {
    if !submission.is_object() {
        return Err(GatewayError::validation("transaction must be a JSON object"));
    }

    let mut accepted = state.ledger.submit_transaction(&submission).await?;
    let id = accepted_id(&accepted).ok_or_else(|| {
        GatewayError::upstream(LEDGER_NAME, "response carried no transaction identifier")
    })?;

    let outcome = state.intake.record_accepted(&id).await;
    info!(
        hash = %id,
        duplicate = outcome.duplicate,
        degraded = outcome.is_degraded(),
        "Transaction submitted"
    );

    if let Value::Object(fields) = &mut accepted {
        fields
            .entry("transaction_id")
            .or_insert_with(|| Value::String(id));
    }
    Ok(Json(accepted))
}

async fn get_transaction_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(state.ledger.transaction_status(&id).await?))
}

/// GET /transactions/{id}/pipeline - The local record: status, attempts and
/// timestamps.
async fn get_transaction_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    match state.transactions.get(&id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(GatewayError::not_found(format!("transaction {id}"))),
    }
}

async fn get_latest_block(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(Json(state.ledger.latest_block().await?))
}

async fn get_block(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> Result<Json<Value>> {
    let number: u64 = number
        .parse()
        .map_err(|_| GatewayError::validation("block number must be a non-negative integer"))?;
    Ok(Json(state.ledger.block_by_number(number).await?))
}

// ============================================================================
// Messages
// ============================================================================

/// Request body of `POST /messages`.
#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub sender: String,
    pub recipient: String,
    /// Base64.
    pub content_ciphertext: String,
    /// Base64.
    pub content_nonce: String,
}

/// Response body of `POST /messages`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateMessageResponse {
    pub id: i64,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|_| GatewayError::validation(format!("{field} must be base64")))?;
    if bytes.is_empty() {
        return Err(GatewayError::validation(format!("{field} is required")));
    }
    Ok(bytes)
}

/// POST /messages - Store a message and announce it on the `messages` channel.
///
/// A message with the same ciphertext and nonce as an existing one returns
/// the existing row with `200 OK` and is not announced again; a new message
/// returns `201 Created`.
async fn post_message(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CreateMessageRequest>,
) -> Result<Response> {
    require("sender", &req.sender)?;
    require("recipient", &req.recipient)?;
    let new = NewMessage {
        ciphertext: decode_base64("content_ciphertext", &req.content_ciphertext)?,
        nonce: decode_base64("content_nonce", &req.content_nonce)?,
        sender: req.sender,
        recipient: req.recipient,
    };

    let created = state.messages.create_message(new).await?;
    let message = &created.message;

    if created.created {
        match serde_json::to_string(&MessageNotice::from(message)) {
            Ok(data) => {
                publish_or_log(state.publisher.as_ref(), Envelope::new(MESSAGES_CHANNEL, data))
                    .await;
            }
            Err(err) => debug!(error = %err, "Failed to serialize message notice"),
        }
        info!(id = message.id, hash = %message.hash, "Message created");
    } else {
        debug!(id = message.id, hash = %message.hash, "Duplicate message, returning existing row");
    }

    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let body = CreateMessageResponse {
        id: message.id,
        hash: message.hash.clone(),
        created_at: message.created_at,
    };
    Ok((status, Json(body)).into_response())
}

/// Query parameters of `GET /messages`.
#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    pub address: Option<String>,
    pub peer: Option<String>,
    /// RFC 3339 timestamp; only newer messages are returned.
    pub since: Option<String>,
    pub limit: Option<usize>,
}

impl ListMessagesParams {
    fn into_query(self) -> Result<MessageQuery> {
        let address = self.address.unwrap_or_default();
        let peer = self.peer.unwrap_or_default();
        require("address", &address)?;
        require("peer", &peer)?;

        let since = match self.since.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| GatewayError::validation("since must be an RFC 3339 timestamp"))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let limit = match self.limit {
            Some(0) => return Err(GatewayError::validation("limit must be positive")),
            Some(limit) => limit.min(MAX_MESSAGE_LIMIT),
            None => DEFAULT_MESSAGE_LIMIT,
        };

        Ok(MessageQuery {
            address,
            peer,
            since,
            limit,
        })
    }
}

/// GET /messages - Messages exchanged by `address` and `peer`, oldest first.
async fn get_messages(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<ListMessagesParams>,
) -> Result<Response> {
    let query = params.into_query()?;
    let messages = state.messages.list_messages(&query).await?;
    Ok(Json(messages).into_response())
}

/// Request body of `POST /messages/{id}/anchor`.
#[derive(Debug, Deserialize)]
pub struct AnchorRequest {
    pub block: i64,
}

/// POST /messages/{id}/anchor - Record the block a message was anchored in.
///
/// Repeating the call with the same block is accepted; a different block
/// is rejected with `400`.
async fn post_anchor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AnchorRequest>,
) -> Result<Json<Value>> {
    let id: i64 = id
        .parse()
        .map_err(|_| GatewayError::validation("message id must be an integer"))?;
    if req.block < 0 {
        return Err(GatewayError::validation("block must be non-negative"));
    }

    match state.messages.anchor_message(id, req.block).await? {
        AnchorOutcome::Anchored | AnchorOutcome::Unchanged => {
            info!(id, block = req.block, "Message anchored");
            Ok(Json(serde_json::json!({ "id": id, "anchored_at_block": req.block })))
        }
        AnchorOutcome::Conflict { existing } => Err(GatewayError::validation(format!(
            "message {id} is already anchored at block {existing}"
        ))),
        AnchorOutcome::NotFound => Err(GatewayError::not_found(format!("message {id}"))),
    }
}

// ============================================================================
// Signals and streams
// ============================================================================

/// Request body of `POST /signals`.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
}

/// POST /signals - Publish a signal to `signals:{to}`. Nothing is stored.
async fn post_signal(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<SignalRequest>,
) -> Result<Response> {
    require("from", &req.from)?;
    require("to", &req.to)?;
    require("type", &req.kind)?;

    let envelope = SignalEnvelope {
        from: req.from,
        to: req.to,
        kind: req.kind,
        payload: req.payload.unwrap_or_default(),
        timestamp: Utc::now(),
    };
    let channel = signal_channel(&envelope.to);
    let data = serde_json::to_string(&envelope)
        .map_err(|e| GatewayError::internal(format!("failed to serialize signal: {e}")))?;

    publish_or_log(state.publisher.as_ref(), Envelope::new(channel.clone(), data)).await;
    debug!(channel = %channel, kind = %envelope.kind, "Signal published");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
        .into_response())
}

/// GET /stream/messages - Every new message, as SSE `message` events.
async fn stream_messages(State(state): State<AppState>) -> Response {
    info!("Message stream client connected");
    sse_response(state.hub.subscribe(MESSAGES_CHANNEL), "message").into_response()
}

/// Query parameters of `GET /stream/signals`.
#[derive(Debug, Deserialize)]
pub struct SignalStreamParams {
    pub address: Option<String>,
}

/// GET /stream/signals?address= - Signals addressed to `address`, as SSE
/// `signal` events.
async fn stream_signals(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<SignalStreamParams>,
) -> Result<Response> {
    let address = params.address.unwrap_or_default();
    require("address", &address)?;

    info!(address = %address, "Signal stream client connected");
    Ok(sse_response(state.hub.subscribe(&signal_channel(&address)), "signal").into_response())
}

// ============================================================================
// Reverse proxy
// ============================================================================

/// Fallback: forwards paths under a configured prefix, 404 otherwise.
async fn proxy_request(State(state): State<AppState>, request: Request) -> Response {
    match state.routes.resolve(request.uri().path()) {
        Some(route) => state.forwarder.forward(&route, request).await,
        None => GatewayError::not_found(format!("no route for {}", request.uri().path()))
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================
