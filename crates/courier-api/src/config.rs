//! Configuration management for the courier dispatch service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use courier_core::PrunePolicy;
use courier_dispatch::{
    engine::DEFAULT_BULK_SMS_INTERVAL, BackoffStrategy, EngineConfig, LaneConfig, RetryPolicy,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use courier_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// How many times startup retries the first database connection.
    ///
    /// Environment variable: `DATABASE_CONNECT_RETRIES`
    #[serde(default = "default_connect_retries", alias = "DATABASE_CONNECT_RETRIES")]
    pub database_connect_retries: u32,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Dispatch
    /// Workers per lane.
    ///
    /// Environment variable: `WORKER_COUNT`
    #[serde(default = "default_worker_count", alias = "WORKER_COUNT")]
    pub worker_count: usize,
    /// Idle poll interval in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Minimum spacing between `bulk-sms` sends in milliseconds.
    ///
    /// Environment variable: `BULK_SMS_INTERVAL_MS`
    #[serde(default = "default_bulk_sms_interval_ms", alias = "BULK_SMS_INTERVAL_MS")]
    pub bulk_sms_interval_ms: u64,
    /// Leases per lane per rolling minute. Zero disables the cap.
    ///
    /// Environment variable: `LEASE_CAP_PER_MINUTE`
    #[serde(default = "default_lease_cap", alias = "LEASE_CAP_PER_MINUTE")]
    pub lease_cap_per_minute: u32,
    /// Upper bound on one handler invocation in seconds.
    ///
    /// Environment variable: `HANDLER_TIMEOUT_SECONDS`
    #[serde(default = "default_handler_timeout", alias = "HANDLER_TIMEOUT_SECONDS")]
    pub handler_timeout_seconds: u64,
    /// How long shutdown waits for in-flight handlers, in seconds.
    ///
    /// Environment variable: `DRAIN_TIMEOUT_SECONDS`
    #[serde(default = "default_drain_timeout", alias = "DRAIN_TIMEOUT_SECONDS")]
    pub drain_timeout_seconds: u64,
    /// Pause after the last shutdown step in milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_MS`
    #[serde(default = "default_shutdown_grace_ms", alias = "SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: u64,

    // Retry
    /// Maximum handler invocations per job unless the producer asks otherwise.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Maintenance
    /// Seconds between prune/requeue passes. Zero disables them.
    ///
    /// Environment variable: `MAINTENANCE_INTERVAL_SECONDS`
    #[serde(default = "default_maintenance_interval", alias = "MAINTENANCE_INTERVAL_SECONDS")]
    pub maintenance_interval_seconds: u64,
    /// Leases older than this many seconds are treated as abandoned.
    ///
    /// Environment variable: `STALE_LEASE_SECONDS`
    #[serde(default = "default_stale_lease", alias = "STALE_LEASE_SECONDS")]
    pub stale_lease_seconds: u64,
    /// Completed jobs older than this many seconds are pruned.
    ///
    /// Environment variable: `PRUNE_COMPLETED_AGE_SECONDS`
    #[serde(default = "default_completed_age", alias = "PRUNE_COMPLETED_AGE_SECONDS")]
    pub prune_completed_age_seconds: u64,
    /// Newest completed jobs kept per lane.
    ///
    /// Environment variable: `PRUNE_COMPLETED_RETAIN`
    #[serde(default = "default_completed_retain", alias = "PRUNE_COMPLETED_RETAIN")]
    pub prune_completed_retain: usize,
    /// Failed jobs older than this many seconds are pruned. Zero keeps them.
    ///
    /// Environment variable: `PRUNE_FAILED_AGE_SECONDS`
    #[serde(default = "default_failed_age", alias = "PRUNE_FAILED_AGE_SECONDS")]
    pub prune_failed_age_seconds: u64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or the merged values fail
    /// validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the engine configuration: a throttled `bulk-sms` lane and an
    /// unthrottled `files` lane.
    pub fn to_engine_config(&self) -> EngineConfig {
        let lease_cap = (self.lease_cap_per_minute > 0).then_some(self.lease_cap_per_minute);
        let maintenance_interval = (self.maintenance_interval_seconds > 0)
            .then(|| Duration::from_secs(self.maintenance_interval_seconds));

        EngineConfig {
            lanes: vec![
                LaneConfig::bulk_sms()
                    .with_workers(self.worker_count)
                    .with_rate_limit(Duration::from_millis(self.bulk_sms_interval_ms))
                    .with_lease_cap(lease_cap),
                LaneConfig::files().with_workers(self.worker_count).with_lease_cap(lease_cap),
            ],
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            handler_timeout: Duration::from_secs(self.handler_timeout_seconds),
            drain_timeout: Duration::from_secs(self.drain_timeout_seconds),
            maintenance_interval,
            stale_lease_after: Duration::from_secs(self.stale_lease_seconds),
            prune_policy: self.to_prune_policy(),
            retry_policy: self.to_retry_policy(),
            ..EngineConfig::default()
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Convert to retention thresholds.
    pub fn to_prune_policy(&self) -> PrunePolicy {
        PrunePolicy {
            completed_max_age: Duration::from_secs(self.prune_completed_age_seconds),
            completed_retain: self.prune_completed_retain,
            failed_max_age: (self.prune_failed_age_seconds > 0)
                .then(|| Duration::from_secs(self.prune_failed_age_seconds)),
        }
    }

    /// Pause after the final shutdown step.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.bulk_sms_interval_ms == 0 {
            anyhow::bail!("bulk_sms_interval_ms must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        self.to_engine_config().validate().context("invalid dispatch settings")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_connect_retries: default_connect_retries(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            bulk_sms_interval_ms: default_bulk_sms_interval_ms(),
            lease_cap_per_minute: default_lease_cap(),
            handler_timeout_seconds: default_handler_timeout(),
            drain_timeout_seconds: default_drain_timeout(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            maintenance_interval_seconds: default_maintenance_interval(),
            stale_lease_seconds: default_stale_lease(),
            prune_completed_age_seconds: default_completed_age(),
            prune_completed_retain: default_completed_retain(),
            prune_failed_age_seconds: default_failed_age(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_connect_retries() -> u32 {
    5
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_count() -> usize {
    courier_dispatch::DEFAULT_WORKER_COUNT
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_bulk_sms_interval_ms() -> u64 {
    u64::try_from(DEFAULT_BULK_SMS_INTERVAL.as_millis()).unwrap_or(20_000)
}

fn default_lease_cap() -> u32 {
    courier_dispatch::DEFAULT_LEASES_PER_MINUTE
}

fn default_handler_timeout() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_shutdown_grace_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    courier_core::DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_factor() -> f64 {
    0.0
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_stale_lease() -> u64 {
    15 * 60
}

fn default_completed_age() -> u64 {
    60 * 60
}

fn default_completed_retain() -> usize {
    100
}

fn default_failed_age() -> u64 {
    24 * 60 * 60
}

fn default_log_level() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}
