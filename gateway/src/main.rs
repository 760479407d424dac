//! Tollgate Gateway - Main entry point.
//!
//! This binary starts the gateway with:
//! - Structured JSON logging
//! - Redis (counters, work queue, pub/sub) and Postgres backends when
//!   configured, process memory otherwise
//! - Queue consumer workers, the pub/sub bridge and counter cleanup
//! - Prometheus metrics at `GET /metrics`
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`tollgate_gateway::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Single process, no auth
//! TOLLGATE_LEDGER_URL=http://localhost:8000 \
//! TOLLGATE_AUTH_REQUIRED=false \
//! cargo run --bin tollgate-gateway
//!
//! # Production
//! TOLLGATE_LEDGER_URL=http://ledger:8000 \
//! TOLLGATE_JWT_SECRET=... \
//! TOLLGATE_ROUTES="/backend=http://backend:9000" \
//! TOLLGATE_REDIS_URL=redis://redis:6379 \
//! TOLLGATE_DATABASE_URL=postgres://tollgate@db/tollgate \
//! cargo run --release --bin tollgate-gateway
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use tollgate_gateway::broadcast::{spawn_redis_bridge, EventHub, RedisPublisher};
use tollgate_gateway::config::Config;
use tollgate_gateway::queue::{MemoryQueue, RedisQueue, WorkQueue};
use tollgate_gateway::rate_limit::{MemoryCounterStore, RedisCounterStore};
use tollgate_gateway::routes::{create_router, AppState, Backends};
use tollgate_gateway::store::{MemoryStore, MessageStore, PgStore, TransactionStore};
use tollgate_gateway::worker::{RetryPolicy, Worker};

/// Cleanup interval for expired per-process rate limit counters.
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Backends plus the per-worker queue handles and background tasks they need.
struct Runtime {
    backends: Backends,
    worker_queues: Vec<Arc<dyn WorkQueue>>,
    background: Vec<JoinHandle<()>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  TOLLGATE_LEDGER_URL      - Base URL of the ledger service");
            eprintln!("  TOLLGATE_JWT_SECRET      - HS256 secret (unless TOLLGATE_AUTH_REQUIRED=false)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                     - HTTP server port (default: 8080)");
            eprintln!("  TOLLGATE_ROUTES          - Proxy routes: /prefix=http://host,...");
            eprintln!("  TOLLGATE_REDIS_URL       - Shared counters, queue and pub/sub");
            eprintln!("  TOLLGATE_DATABASE_URL    - Postgres durable store");
            eprintln!("  TOLLGATE_RATE_LIMIT_RPM  - Requests per route per client per minute (default: 100)");
            eprintln!("  TOLLGATE_WORKERS         - Queue consumer tasks (default: 1)");
            eprintln!("  RUST_LOG                 - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        routes = config.routes.len(),
        auth_required = config.auth_required,
        redis = config.redis_url.is_some(),
        postgres = config.database_url.is_some(),
        workers = config.workers,
        "Tollgate gateway starting"
    );

    let runtime = match build_runtime(&config).await {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Failed to initialize backends");
            return ExitCode::from(1);
        }
    };
    let Runtime {
        backends,
        worker_queues,
        mut background,
    } = runtime;

    let transactions = backends.transactions.clone();
    let state = match AppState::new(config.clone(), backends) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to build application state");
            return ExitCode::from(1);
        }
    };

    let policy = RetryPolicy::from_config(&config);
    for (id, queue) in worker_queues.into_iter().enumerate() {
        let worker = Worker::new(id, queue, transactions.clone(), policy)
            .with_metrics(state.metrics.clone());
        background.push(worker.spawn());
    }

    background.push(
        state
            .rate_limiter
            .fallback_store()
            .spawn_cleanup_task(RATE_LIMITER_CLEANUP_INTERVAL),
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "Server listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "Failed to bind to address");
            return ExitCode::from(1);
        }
    };

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    info!(tasks = background.len(), "Server drained, stopping background tasks");
    for task in background {
        task.abort();
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Connects the configured backends, falling back to process memory for
/// whatever is not configured.
async fn build_runtime(config: &Config) -> anyhow::Result<Runtime> {
    let mut background = Vec::new();

    let (transactions, messages): (Arc<dyn TransactionStore>, Arc<dyn MessageStore>) =
        match &config.database_url {
            Some(url) => {
                let store = PgStore::connect(url)
                    .await
                    .context("failed to connect to Postgres")?;
                info!("Postgres store ready");
                (Arc::new(store.clone()), Arc::new(store))
            }
            None => {
                warn!("TOLLGATE_DATABASE_URL not set, records are kept in memory only");
                let store = MemoryStore::new();
                (Arc::new(store.clone()), Arc::new(store))
            }
        };

    let hub = EventHub::new();

    let Some(url) = &config.redis_url else {
        warn!("TOLLGATE_REDIS_URL not set, rate limits, queue and streams are per-process");
        let counters = MemoryCounterStore::new();
        background.push(counters.spawn_cleanup_task(RATE_LIMITER_CLEANUP_INTERVAL));

        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new());
        return Ok(Runtime {
            worker_queues: vec![queue.clone(); config.workers],
            backends: Backends {
                transactions,
                messages,
                queue,
                counters: Arc::new(counters),
                publisher: Arc::new(hub.clone()),
                hub,
            },
            background,
        });
    };

    let client = redis::Client::open(url.as_str()).context("invalid Redis URL")?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .context("failed to connect to Redis")?;
    info!("Redis connection ready");

    let queue = RedisQueue::new(client.clone(), conn.clone());
    let worker_queues = (0..config.workers)
        .map(|_| Arc::new(queue.consumer()) as Arc<dyn WorkQueue>)
        .collect();
    background.push(spawn_redis_bridge(client, hub.clone()));

    Ok(Runtime {
        backends: Backends {
            transactions,
            messages,
            queue: Arc::new(queue),
            counters: Arc::new(RedisCounterStore::new(conn.clone())),
            publisher: Arc::new(RedisPublisher::new(conn)),
            hub,
        },
        worker_queues,
        background,
    })
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default
/// `info,tower_http=debug,axum::rejection=trace`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
