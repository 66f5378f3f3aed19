//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or `COURIER_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources
//! override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `COURIER_`
//! 3. **DATABASE_URL / REDIS_URL** - Special cases overriding the nested
//!    `database.url` and `redis.url` fields
//!
//! For nested config values, use double underscores in environment
//! variables: `COURIER_WEBHOOK__TIMEOUT_SECS=15` sets `webhook.timeout_secs`.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "COURIER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty config file is a valid deployment
/// against a local Postgres and Redis.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// PostgreSQL connection settings
    pub database: DatabaseConfig,
    /// Redis connection settings (shared cache, queue, and rate-limit state)
    pub redis: RedisConfig,
    /// Outbound webhook delivery settings
    pub webhook: WebhookConfig,
    /// Subscription cache settings
    pub cache: CacheConfig,
    /// Ingress rate limiting settings
    pub rate_limit: RateLimitConfig,
    /// Retention windows for logs and failed tasks
    pub retention: RetentionConfig,
    /// Delivery worker pool settings
    pub worker: WorkerConfig,
    /// Background services configuration
    pub background_services: BackgroundServicesConfig,
    /// Enable the Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            webhook: WebhookConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retention: RetentionConfig::default(),
            worker: WorkerConfig::default(),
            background_services: BackgroundServicesConfig::default(),
            enable_metrics: false,
        }
    }
}

/// PostgreSQL connection and pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string for the database
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseConfig {
    /// Production defaults: balanced for reliability and resource usage
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/courier".to_string(),
            max_connections: 20,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800, // 30 minutes
        }
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    /// Connection URL (redis://[:password@]host:port/db)
    pub url: String,
    /// Socket-level timeout applied to every Redis operation (seconds).
    /// Broker and cache calls fail open, so this bounds how long a Redis
    /// outage can stall a request.
    pub operation_timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            operation_timeout_secs: 2,
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Per-attempt HTTP deadline (seconds)
    pub timeout_secs: u64,
    /// Retry budget per task
    pub max_retries: i32,
    /// Backoff schedule in seconds, indexed by prior attempts
    pub retry_delays_secs: Vec<i64>,
    /// Maximum accepted ingress payload size in bytes
    pub max_payload_size: usize,
    /// Verify TLS certificates of target URLs
    pub verify_ssl_certificates: bool,
    /// Maximum sends per target URL within the target rate-limit window
    pub target_rate_limit: i64,
    /// Window for the per-target rate limit (seconds)
    pub target_rate_limit_window_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 5,
            retry_delays_secs: vec![10, 30, 60, 300, 900],
            max_payload_size: 1024 * 1024, // 1 MiB
            verify_ssl_certificates: true,
            target_rate_limit: 10,
            target_rate_limit_window_secs: 60,
        }
    }
}

impl WebhookConfig {
    /// Backoff delay before the next retry, indexed by *prior* attempts:
    /// the first retry (one attempt made) waits `retry_delays_secs[0]`.
    /// Schedules shorter than the retry budget repeat their last entry.
    pub fn backoff_delay_secs(&self, attempt_count: i32) -> i64 {
        let index = (attempt_count.max(1) - 1) as usize;
        self.retry_delays_secs
            .get(index)
            .or(self.retry_delays_secs.last())
            .copied()
            .unwrap_or(60)
    }
}

/// Subscription cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL for cached subscription records (seconds). The version key
    /// lives twice as long.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

/// Rate limiting window strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    FixedWindow,
    SlidingWindow,
}

/// Ingress rate limiting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Master switch for the ingress limiter
    pub enabled: bool,
    /// Window strategy
    pub strategy: RateLimitStrategy,
    /// Requests allowed per client per route per window
    pub limit: i64,
    /// Window length (seconds)
    pub window_secs: i64,
    /// Stricter limit applied to subscription creation
    pub subscription_create_limit: i64,
    /// Window for the subscription creation limit (seconds)
    pub subscription_create_window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::FixedWindow,
            limit: 100,
            window_secs: 60,
            subscription_create_limit: 5,
            subscription_create_window_secs: 60,
        }
    }
}

/// Retention windows for periodic cleanup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Delivery logs older than this are deleted (hours)
    pub log_retention_hours: i64,
    /// FAILED tasks older than this are deleted (days)
    pub failed_task_retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            log_retention_hours: 72,
            failed_task_retention_days: 7,
        }
    }
}

/// Delivery worker pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Number of concurrent delivery workers
    pub count: usize,
    /// Blocking queue pop timeout per iteration (seconds)
    pub poll_timeout_secs: u64,
    /// IN_PROGRESS tasks older than this are returned to PENDING (seconds)
    pub processing_timeout_secs: u64,
    /// Interval of the maintenance sweep (seconds)
    pub maintenance_interval_secs: u64,
    /// Delay before re-enqueueing a task deferred by the per-target limiter (seconds)
    pub target_limited_delay_secs: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_timeout_secs: 5,
            processing_timeout_secs: 300,
            maintenance_interval_secs: 60,
            target_limited_delay_secs: 5,
        }
    }
}

/// Background services configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundServicesConfig {
    pub leader_election: LeaderElectionConfig,
}

/// Leader election configuration. When disabled every replica runs the
/// periodic jobs, which is safe (they are idempotent) but wasteful.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the YAML file and environment.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("COURIER_").split("__"))
            .extract()?;

        // DATABASE_URL and REDIS_URL are honored directly for compatibility
        // with standard deployment tooling.
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.webhook.retry_delays_secs.is_empty() {
            anyhow::bail!("webhook.retry_delays_secs must not be empty");
        }
        if self.webhook.max_retries < 0 {
            anyhow::bail!("webhook.max_retries must be non-negative");
        }
        if self.webhook.max_payload_size == 0 {
            anyhow::bail!("webhook.max_payload_size must be positive");
        }
        if self.worker.count == 0 {
            anyhow::bail!("worker.count must be positive");
        }
        if self.rate_limit.limit <= 0 || self.rate_limit.window_secs <= 0 {
            anyhow::bail!("rate_limit.limit and rate_limit.window_secs must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_service_contract() {
        let config = Config::default();
        assert_eq!(config.webhook.timeout_secs, 10);
        assert_eq!(config.webhook.max_retries, 5);
        assert_eq!(config.webhook.retry_delays_secs, vec![10, 30, 60, 300, 900]);
        assert_eq!(config.webhook.max_payload_size, 1024 * 1024);
        assert!(config.webhook.verify_ssl_certificates);
        assert_eq!(config.retention.log_retention_hours, 72);
        assert_eq!(config.retention.failed_task_retention_days, 7);
        assert_eq!(config.rate_limit.subscription_create_limit, 5);
        assert!(config.validate().is_ok());
    }

    #[rstest::rstest]
    #[case(1, 10)]
    #[case(2, 30)]
    #[case(3, 60)]
    #[case(4, 300)]
    #[case(5, 900)]
    // Schedules shorter than the budget repeat the last entry
    #[case(6, 900)]
    fn test_backoff_schedule_indexed_by_prior_attempts(#[case] attempt_count: i32, #[case] expected_secs: i64) {
        let webhook = WebhookConfig::default();
        assert_eq!(webhook.backoff_delay_secs(attempt_count), expected_secs);
    }

    #[test]
    fn test_env_overrides_nested_fields() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("COURIER_WEBHOOK__TIMEOUT_SECS", "25");
            jail.set_env("COURIER_RATE_LIMIT__STRATEGY", "sliding-window");

            let config: Config = Figment::new()
                .merge(Env::prefixed("COURIER_").split("__"))
                .extract()
                .unwrap();

            assert_eq!(config.webhook.timeout_secs, 25);
            assert_eq!(config.rate_limit.strategy, RateLimitStrategy::SlidingWindow);
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_empty_schedule() {
        let mut config = Config::default();
        config.webhook.retry_delays_secs.clear();
        assert!(config.validate().is_err());
    }
}
