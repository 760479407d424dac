//! Tollgate Gateway - edge gateway and asynchronous transaction pipeline.
//!
//! This crate provides:
//! - Admission control: bearer JWT auth and per-route-per-client rate limiting
//! - Reverse proxying of configured path prefixes to internal services
//! - Transaction intake, with a queue consumer that retries with backoff
//! - Chat messages and peer signals, fanned out to SSE listeners
//!
//! # Architecture
//!
//! ```text
//! client -> auth gate -> rate limiter -> proxy | handlers
//!                                                  |
//!                        ledger <- POST /transactions -> store + queue -> worker
//!                        hub    <- POST /messages, /signals -> SSE streams
//! ```
//!
//! Shared state (counters, queue, pub/sub) lives in Redis when configured
//! and in process memory otherwise; durable records live in Postgres or in
//! memory.

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod intake;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod rate_limit;
pub mod routes;
pub mod routing;
pub mod store;
pub mod stream;
pub mod types;
pub mod upstream;
pub mod worker;
