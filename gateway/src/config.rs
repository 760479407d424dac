//! Gateway configuration module.
//!
//! Parses configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TOLLGATE_LEDGER_URL` | Yes | - | Base URL of the owning ledger service |
//! | `TOLLGATE_JWT_SECRET` | Yes* | - | HS256 secret for bearer tokens |
//! | `TOLLGATE_ROUTES` | No | - | Format: `/prefix=http://host:port,/other=http://...` |
//! | `TOLLGATE_AUTH_REQUIRED` | No | true | Require a bearer token on non-public endpoints |
//! | `TOLLGATE_REDIS_URL` | No | - | Shared counter store, work queue and pub/sub |
//! | `TOLLGATE_DATABASE_URL` | No | - | Postgres durable store |
//! | `TOLLGATE_RATE_LIMIT_RPM` | No | 100 | Requests per minute per route and client |
//! | `TOLLGATE_RATE_LIMIT_FALLBACK` | No | local | `local` or `open` when the shared store fails |
//! | `TOLLGATE_TRUST_FORWARDED_FOR` | No | false | Identify clients by `X-Forwarded-For` |
//! | `TOLLGATE_RETRY_CEILING` | No | 5 | Retries before a work item is dropped |
//! | `TOLLGATE_BACKOFF_BASE_MS` | No | 1000 | Backoff base, doubled per retry |
//! | `TOLLGATE_WORKERS` | No | 1 | Queue consumer tasks |
//! | `TOLLGATE_UPSTREAM_TIMEOUT_SECS` | No | 10 | Upstream request timeout |
//! | `TOLLGATE_ALLOWED_ORIGINS` | No | - | CORS allow-list, empty allows any origin |
//! | `PORT` | No | 8080 | HTTP server port |
//!
//! *Not required if `TOLLGATE_AUTH_REQUIRED=false`

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::routing::RouteEntry;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default per-route-per-client ceiling for one 60 second window.
pub const DEFAULT_RATE_LIMIT_RPM: u64 = 100;

/// Default number of retries before a work item is dropped.
pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Default backoff base (one second).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Default upstream request timeout.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    /// Creates a missing variable error.
    pub fn missing(var: impl Into<String>) -> Self {
        Self::MissingEnvVar(var.into())
    }

    /// Creates an invalid format error.
    pub fn invalid(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// What the rate limiter does when the shared counter store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Count in a per-process store until the shared store recovers.
    #[default]
    Local,
    /// Admit every request until the shared store recovers.
    Open,
}

/// Gateway configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Reverse proxy route table entries.
    pub routes: Vec<RouteEntry>,

    /// Base URL of the owning ledger service.
    pub ledger_url: String,

    /// HS256 secret for bearer tokens.
    pub jwt_secret: Option<String>,

    /// When false, the auth gate admits every request.
    pub auth_required: bool,

    /// Redis URL for the shared counter store, queue and pub/sub.
    pub redis_url: Option<String>,

    /// Postgres URL for the durable store.
    pub database_url: Option<String>,

    /// Per-route-per-client request ceiling per window.
    pub rate_limit_rpm: u64,

    /// Behaviour when the shared counter store fails.
    pub rate_limit_fallback: FallbackPolicy,

    /// Identify clients by the first `X-Forwarded-For` hop.
    pub trust_forwarded_for: bool,

    /// Retries before a work item is dropped.
    pub retry_ceiling: u32,

    /// Backoff base; the delay before retry `n+1` is `base * 2^n`.
    pub backoff_base: Duration,

    /// Number of queue consumer tasks.
    pub workers: usize,

    /// Timeout for proxied and ledger requests.
    pub upstream_timeout: Duration,

    /// CORS allow-list. Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            routes: Vec::new(),
            ledger_url: "http://127.0.0.1:8000".to_string(),
            jwt_secret: None,
            auth_required: false,
            redis_url: None,
            database_url: None,
            rate_limit_rpm: DEFAULT_RATE_LIMIT_RPM,
            rate_limit_fallback: FallbackPolicy::Local,
            trust_forwarded_for: false,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            backoff_base: DEFAULT_BACKOFF_BASE,
            workers: 1,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `TOLLGATE_LEDGER_URL` is missing
    /// - `TOLLGATE_JWT_SECRET` is missing while auth is required
    /// - A variable has an invalid format
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tollgate_gateway::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Gateway will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let ledger_url = non_empty_env("TOLLGATE_LEDGER_URL")
            .ok_or_else(|| ConfigError::missing("TOLLGATE_LEDGER_URL"))?;

        let config = Self {
            port: parse_number_env("PORT", DEFAULT_PORT)?,
            routes: parse_routes()?,
            ledger_url: ledger_url.trim_end_matches('/').to_string(),
            jwt_secret: non_empty_env("TOLLGATE_JWT_SECRET"),
            auth_required: parse_bool_env("TOLLGATE_AUTH_REQUIRED", true)?,
            redis_url: non_empty_env("TOLLGATE_REDIS_URL"),
            database_url: non_empty_env("TOLLGATE_DATABASE_URL"),
            rate_limit_rpm: parse_number_env("TOLLGATE_RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?,
            rate_limit_fallback: parse_fallback()?,
            trust_forwarded_for: parse_bool_env("TOLLGATE_TRUST_FORWARDED_FOR", false)?,
            retry_ceiling: parse_number_env("TOLLGATE_RETRY_CEILING", DEFAULT_RETRY_CEILING)?,
            backoff_base: Duration::from_millis(parse_number_env(
                "TOLLGATE_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE.as_millis() as u64,
            )?),
            workers: parse_number_env("TOLLGATE_WORKERS", 1)?,
            upstream_timeout: Duration::from_secs(parse_number_env(
                "TOLLGATE_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT.as_secs(),
            )?),
            allowed_origins: parse_list_env("TOLLGATE_ALLOWED_ORIGINS"),
        };

        config.validate()?;

        if !config.auth_required {
            warn!(
                "TOLLGATE_AUTH_REQUIRED is false - bearer authentication is disabled. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_required && self.jwt_secret.is_none() {
            return Err(ConfigError::missing("TOLLGATE_JWT_SECRET"));
        }

        if reqwest::Url::parse(&self.ledger_url).is_err() {
            return Err(ConfigError::invalid(
                "TOLLGATE_LEDGER_URL",
                format!("'{}' is not a valid URL", self.ledger_url),
            ));
        }

        if self.rate_limit_rpm == 0 {
            return Err(ConfigError::ValidationError(
                "TOLLGATE_RATE_LIMIT_RPM must be positive".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationError(
                "TOLLGATE_WORKERS must be positive".to_string(),
            ));
        }

        if self.retry_ceiling == 0 {
            return Err(ConfigError::ValidationError(
                "TOLLGATE_RETRY_CEILING must be positive".to_string(),
            ));
        }

        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "TOLLGATE_UPSTREAM_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a boolean environment variable.
///
/// Accepts `1/true/yes/on` and `0/false/no/off` (case-insensitive).
/// Returns `default` when unset.
fn parse_bool_env(name: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(default);
    };

    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(
            name,
            format!("expected a boolean, got '{other}'"),
        )),
    }
}

fn parse_number_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_env(name) {
        Some(raw) => raw
            .parse()
            .map_err(|err| ConfigError::invalid(name, format!("'{raw}': {err}"))),
        None => Ok(default),
    }
}

fn parse_list_env(name: &str) -> Vec<String> {
    non_empty_env(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_fallback() -> Result<FallbackPolicy, ConfigError> {
    match non_empty_env("TOLLGATE_RATE_LIMIT_FALLBACK").as_deref() {
        None | Some("local") => Ok(FallbackPolicy::Local),
        Some("open") => Ok(FallbackPolicy::Open),
        Some(other) => Err(ConfigError::invalid(
            "TOLLGATE_RATE_LIMIT_FALLBACK",
            format!("expected 'local' or 'open', got '{other}'"),
        )),
    }
}

/// Parse the TOLLGATE_ROUTES environment variable.
///
/// Expected format: `/prefix1=http://host1,/prefix2=http://host2/base`
fn parse_routes() -> Result<Vec<RouteEntry>, ConfigError> {
    let Some(raw) = non_empty_env("TOLLGATE_ROUTES") else {
        return Ok(Vec::new());
    };

    let mut routes = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let Some((prefix, upstream)) = pair.split_once('=') else {
            return Err(ConfigError::invalid(
                "TOLLGATE_ROUTES",
                format!("expected 'prefix=url' format, got '{pair}'"),
            ));
        };

        let entry = RouteEntry::new(prefix.trim(), upstream.trim())
            .map_err(|reason| ConfigError::invalid("TOLLGATE_ROUTES", reason.to_string()))?;
        routes.push(entry);
    }

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteError;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: &[&str] = &[
        "PORT",
        "TOLLGATE_ROUTES",
        "TOLLGATE_LEDGER_URL",
        "TOLLGATE_JWT_SECRET",
        "TOLLGATE_AUTH_REQUIRED",
        "TOLLGATE_REDIS_URL",
        "TOLLGATE_DATABASE_URL",
        "TOLLGATE_RATE_LIMIT_RPM",
        "TOLLGATE_RATE_LIMIT_FALLBACK",
        "TOLLGATE_TRUST_FORWARDED_FOR",
        "TOLLGATE_RETRY_CEILING",
        "TOLLGATE_BACKOFF_BASE_MS",
        "TOLLGATE_WORKERS",
        "TOLLGATE_UPSTREAM_TIMEOUT_SECS",
        "TOLLGATE_ALLOWED_ORIGINS",
    ];

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Starts from a clean slate: every gateway variable is removed.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_required_vars_set() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000/");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ledger_url, "http://ledger:8000");
        assert!(!config.auth_required);
        assert_eq!(config.rate_limit_rpm, DEFAULT_RATE_LIMIT_RPM);
        assert_eq!(config.retry_ceiling, DEFAULT_RETRY_CEILING);
        assert_eq!(config.backoff_base, DEFAULT_BACKOFF_BASE);
        assert_eq!(config.rate_limit_fallback, FallbackPolicy::Local);
        assert!(config.routes.is_empty());
        assert!(config.redis_url.is_none());
    }

    #[test]
    #[serial]
    fn missing_ledger_url_is_an_error() {
        let _guard = EnvGuard::clean();
        let err = Config::from_env().unwrap_err();
        assert_eq!(err, ConfigError::missing("TOLLGATE_LEDGER_URL"));
    }

    #[test]
    #[serial]
    fn auth_required_without_secret_is_an_error() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");

        let err = Config::from_env().unwrap_err();
        assert_eq!(err, ConfigError::missing("TOLLGATE_JWT_SECRET"));
    }

    #[test]
    #[serial]
    fn full_configuration_parses() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_JWT_SECRET", "s3cret");
        guard.set(
            "TOLLGATE_ROUTES",
            "/backend=http://backend:8081, /participant=http://participant:8090/api",
        );
        guard.set("TOLLGATE_RATE_LIMIT_RPM", "30");
        guard.set("TOLLGATE_RATE_LIMIT_FALLBACK", "open");
        guard.set("TOLLGATE_TRUST_FORWARDED_FOR", "yes");
        guard.set("TOLLGATE_RETRY_CEILING", "3");
        guard.set("TOLLGATE_BACKOFF_BASE_MS", "250");
        guard.set("TOLLGATE_WORKERS", "4");
        guard.set("TOLLGATE_ALLOWED_ORIGINS", "https://a.example, https://b.example");
        guard.set("PORT", "9090");

        let config = Config::from_env().expect("should parse config");
        assert!(config.auth_required);
        assert_eq!(config.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[1].prefix(), "/participant");
        assert_eq!(config.rate_limit_rpm, 30);
        assert_eq!(config.rate_limit_fallback, FallbackPolicy::Open);
        assert!(config.trust_forwarded_for);
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(250));
        assert_eq!(config.workers, 4);
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.port, 9090);
    }

    #[test]
    #[serial]
    fn malformed_route_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");
        guard.set("TOLLGATE_ROUTES", "/backend");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "TOLLGATE_ROUTES"));
    }

    #[test]
    #[serial]
    fn invalid_boolean_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "maybe");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidFormat { .. })
        ));
    }

    #[test]
    #[serial]
    fn invalid_port_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");
        guard.set("PORT", "not-a-port");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidFormat { ref var, .. }) if var == "PORT"
        ));
    }

    #[test]
    fn zero_rpm_fails_validation() {
        let config = Config {
            rate_limit_rpm: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    #[serial]
    fn zero_retry_ceiling_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");
        guard.set("TOLLGATE_RETRY_CEILING", "0");

        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::ValidationError("TOLLGATE_RETRY_CEILING must be positive".to_string())
        );
    }

    #[test]
    #[serial]
    fn zero_upstream_timeout_is_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");
        guard.set("TOLLGATE_UPSTREAM_TIMEOUT_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::ValidationError(
                "TOLLGATE_UPSTREAM_TIMEOUT_SECS must be positive".to_string()
            )
        );
    }

    #[test]
    #[serial]
    fn route_with_relative_prefix_reports_reason() {
        let mut guard = EnvGuard::clean();
        guard.set("TOLLGATE_LEDGER_URL", "http://ledger:8000");
        guard.set("TOLLGATE_AUTH_REQUIRED", "false");
        guard.set("TOLLGATE_ROUTES", "backend=http://backend:8081");

        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::invalid(
                "TOLLGATE_ROUTES",
                RouteError::RelativePrefix("backend".to_string()).to_string()
            )
        );
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
