//! Per-route-per-client rate limiting over fixed windows.
//!
//! Every admitted request increments a counter keyed by route, client and
//! window bucket (`rl:{route}:{client}:{floor(now / 60)}`). The increment and
//! the first-increment expiry are one atomic operation against the counter
//! store, so racing requests can never refresh a window's TTL. A request whose
//! count exceeds the ceiling is rejected with 429 and a `Retry-After` equal to
//! the seconds left in the window.
//!
//! # Counter stores
//!
//! - [`RedisCounterStore`]: shared across gateway instances (Lua `INCR` + `EXPIRE`)
//! - [`MemoryCounterStore`]: per-process, also used as the degraded fallback
//!
//! When the shared store fails, the limiter either counts in its local
//! fallback store or admits the request, depending on [`FallbackPolicy`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate_gateway::config::FallbackPolicy;
//! use tollgate_gateway::rate_limit::{MemoryCounterStore, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), 2, FallbackPolicy::Local);
//!
//!     assert!(limiter.check("/transactions", "10.0.0.1").await.is_allowed());
//!     assert!(limiter.check("/transactions", "10.0.0.1").await.is_allowed());
//!     assert!(limiter.check("/transactions", "10.0.0.1").await.is_limited());
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::is_public_path;
use crate::config::FallbackPolicy;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::routing::RouteTable;

/// Fixed window length.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Atomic increment that sets the expiry only on the first increment.
pub const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Errors raised by a counter store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for CounterStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Atomic increment-with-TTL over string keys.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and returns the new count. The TTL is applied only
    /// when this increment created the counter.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError>;
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// The request is allowed to proceed.
    Allowed,

    /// The request is rate limited until the window rolls over.
    Limited { retry_after_secs: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Allowed => None,
            Self::Limited { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

#[derive(Debug)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Per-process counter store.
///
/// Counters past their expiry read as zero and are removed by
/// [`MemoryCounterStore::cleanup_expired`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCounterStore {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes expired counters, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, counter| counter.expires_at > now);
        before - counters.len()
    }

    /// Number of live or not yet pruned counters.
    pub async fn len(&self) -> usize {
        self.counters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawns a task pruning expired counters every `cleanup_interval`.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                let removed = store.cleanup_expired().await;
                if removed > 0 {
                    debug!(removed_count = removed, "Cleaned up expired rate limit counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = Instant::now();
        let mut counters = self.counters.write().await;
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now,
        });

        if counter.expires_at <= now {
            counter.count = 0;
        }
        counter.count += 1;
        if counter.count == 1 {
            counter.expires_at = now + ttl;
        }

        Ok(counter.count)
    }
}

/// Redis-backed counter store shared by every gateway instance.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(redis::Script::new(INCREMENT_SCRIPT)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// Fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    local: MemoryCounterStore,
    policy: FallbackPolicy,
    limit: u64,
    degraded: Arc<AtomicBool>,
    metrics: Option<Metrics>,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` requests per route and client
    /// per window.
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, policy: FallbackPolicy) -> Self {
        Self {
            store,
            local: MemoryCounterStore::new(),
            policy,
            limit,
            degraded: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    /// Counts rejections and fallback decisions in `metrics`.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A limiter counting only in process memory.
    pub fn in_memory(limit: u64) -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()), limit, FallbackPolicy::Local)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The per-process fallback store, for periodic cleanup.
    pub fn fallback_store(&self) -> &MemoryCounterStore {
        &self.local
    }

    /// Checks a request against the current window.
    pub async fn check(&self, route: &str, client: &str) -> RateLimitResult {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.check_at(route, client, now).await
    }

    /// Checks a request as if the wall clock read `now_secs`.
    pub async fn check_at(&self, route: &str, client: &str, now_secs: u64) -> RateLimitResult {
        let window = WINDOW.as_secs();
        let key = counter_key(route, client, now_secs / window);

        let count = match self.store.increment(&key, WINDOW).await {
            Ok(count) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Shared rate limit store recovered");
                }
                count
            }
            Err(err) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %err, policy = ?self.policy, "Rate limiter degraded, shared store failed");
                }
                if let Some(metrics) = &self.metrics {
                    metrics.record_limiter_fallback();
                }
                match self.policy {
                    FallbackPolicy::Open => return RateLimitResult::Allowed,
                    FallbackPolicy::Local => match self.local.increment(&key, WINDOW).await {
                        Ok(count) => count,
                        Err(_) => return RateLimitResult::Allowed,
                    },
                }
            }
        };

        if count > self.limit {
            if let Some(metrics) = &self.metrics {
                metrics.record_rate_limited(route);
            }
            let retry_after_secs = (window - now_secs % window).max(1);
            RateLimitResult::Limited { retry_after_secs }
        } else {
            RateLimitResult::Allowed
        }
    }
}

/// Counter key for a route, client and window bucket.
pub fn counter_key(route: &str, client: &str, bucket: u64) -> String {
    format!("rl:{route}:{client}:{bucket}")
}

/// Derives the caller identity.
///
/// The first `X-Forwarded-For` hop is used only when the gateway sits behind
/// a trusted proxy; otherwise the peer address, or `unknown`.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// State for [`rate_limit_gate`].
#[derive(Clone)]
pub struct RateLimitGate {
    pub limiter: RateLimiter,
    pub routes: Arc<RouteTable>,
    pub trust_forwarded_for: bool,
}

/// Middleware enforcing the rate limit on every non-public request.
///
/// Route identity is the matched route template, or the proxy prefix for
/// proxied paths.
pub async fn rate_limit_gate(
    State(gate): State<RateLimitGate>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let path = request.uri().path();
    if is_public_path(path) {
        return Ok(next.run(request).await);
    }

    let route = gate.routes.identity(
        request.extensions().get::<MatchedPath>().map(MatchedPath::as_str),
        path,
    );
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer, gate.trust_forwarded_for);

    match gate.limiter.check(&route, &client).await {
        RateLimitResult::Allowed => Ok(next.run(request).await),
        RateLimitResult::Limited { retry_after_secs } => {
            debug!(route = %route, client = %client, "Request rate limited");
            Err(GatewayError::rate_limit(client, retry_after_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Counter store that always fails.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }
    }

    /// Counter store that records the TTL passed with each increment.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryCounterStore,
        calls: AtomicU64,
    }

    #[async_trait]
    impl CounterStore for RecordingStore {
        async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.increment(key, ttl).await
        }
    }

    // Start of a window: 1_700_000_040 is divisible by 60.
    const T0: u64 = 1_700_000_040;

    #[tokio::test]
    async fn n_plus_first_request_is_rejected() {
        let limiter = RateLimiter::in_memory(5);
        for i in 0..5 {
            let result = limiter.check_at("/transactions", "1.2.3.4", T0 + i).await;
            assert!(result.is_allowed(), "request {i} should be allowed");
        }
        let result = limiter.check_at("/transactions", "1.2.3.4", T0 + 10).await;
        assert_eq!(result, RateLimitResult::Limited { retry_after_secs: 50 });
    }

    #[tokio::test]
    async fn window_rollover_admits_again() {
        let limiter = RateLimiter::in_memory(1);
        assert!(limiter.check_at("/r", "c", T0 + 59).await.is_allowed());
        assert!(limiter.check_at("/r", "c", T0 + 59).await.is_limited());
        assert!(limiter.check_at("/r", "c", T0 + 60).await.is_allowed());
    }

    #[tokio::test]
    async fn routes_and_clients_are_independent() {
        let limiter = RateLimiter::in_memory(1);
        assert!(limiter.check_at("/a", "c1", T0).await.is_allowed());
        assert!(limiter.check_at("/a", "c2", T0).await.is_allowed());
        assert!(limiter.check_at("/b", "c1", T0).await.is_allowed());
        assert!(limiter.check_at("/a", "c1", T0).await.is_limited());
    }

    #[tokio::test]
    async fn fail_open_admits_when_store_is_down() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 1, FallbackPolicy::Open);
        for _ in 0..10 {
            assert!(limiter.check_at("/r", "c", T0).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn local_fallback_still_enforces_ceiling() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 2, FallbackPolicy::Local);
        assert!(limiter.check_at("/r", "c", T0).await.is_allowed());
        assert!(limiter.check_at("/r", "c", T0).await.is_allowed());
        assert!(limiter.check_at("/r", "c", T0).await.is_limited());
        assert_eq!(limiter.fallback_store().len().await, 1);
    }

    #[tokio::test]
    async fn rejections_and_fallbacks_are_counted() {
        let metrics = Metrics::new().unwrap();
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 1, FallbackPolicy::Local)
            .with_metrics(metrics.clone());

        assert!(limiter.check_at("/r", "c", T0).await.is_allowed());
        assert!(limiter.check_at("/r", "c", T0).await.is_limited());

        let text = metrics.render().unwrap();
        assert!(text.contains("tollgate_rate_limit_fallbacks_total 2"));
        assert!(text.contains(r#"tollgate_rate_limited_total{route="/r"} 1"#));
    }

    #[tokio::test]
    async fn healthy_store_bypasses_local_fallback() {
        let store = Arc::new(RecordingStore::default());
        let limiter = RateLimiter::new(store.clone(), 10, FallbackPolicy::Local);
        limiter.check_at("/r", "c", T0).await;
        limiter.check_at("/r", "c", T0).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(limiter.fallback_store().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_set_only_on_first_increment() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 2);

        // A refreshed TTL would keep the counter alive past the original 60s.
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(store.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_only_expired_counters() {
        let store = MemoryCounterStore::new();
        store.increment("old", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        store.increment("new", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[test]
    fn counter_key_format() {
        assert_eq!(counter_key("/transactions", "10.0.0.1", 42), "rl:/transactions:10.0.0.1:42");
    }

    #[test]
    fn client_identity_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.168.1.5:4000".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer), true), "203.0.113.9");
        assert_eq!(client_identity(&headers, Some(peer), false), "192.168.1.5");
        assert_eq!(client_identity(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn rate_limit_result_helpers() {
        assert!(RateLimitResult::Allowed.is_allowed());
        assert_eq!(RateLimitResult::Allowed.retry_after(), None);
        let limited = RateLimitResult::Limited { retry_after_secs: 5 };
        assert!(limited.is_limited());
        assert_eq!(limited.retry_after(), Some(5));
    }
}
