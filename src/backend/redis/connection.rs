//! Redis connection pool with health checking and retry logic
//!
//! One multiplexed connection shared by all callers, with a semaphore bounding
//! in-flight commands, per-command timeouts and exponential backoff on
//! transient failures. Retries live here, in the store client; the collection
//! engine above never retries.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollcache::backend::redis::{RedisConfig, RedisPool};
//! use std::time::Duration;
//!
//! # async fn example() -> rollcache::Result<()> {
//! let config = RedisConfig::with_url("redis://127.0.0.1:6379")
//!     .pool_size(32)
//!     .command_timeout(Duration::from_millis(500));
//!
//! let pool = RedisPool::new(config).await?;
//! let status = pool.health_check().await;
//! # Ok(())
//! # }
//! ```

use super::util::{backend_error, safe_message};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

/// Configuration for the Redis connection pool
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis server URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of in-flight commands
    /// Default: 16
    pub pool_size: u32,

    /// Timeout for establishing the connection
    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Timeout for individual commands and batches
    /// Default: 1 second
    pub command_timeout: Duration,

    /// Retry policy for transient failures
    pub retry_policy: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl From<&BackendConfig> for RedisConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            url: config.redis_url.clone(),
            pool_size: config.pool_size,
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            retry_policy: RetryPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
        }
    }
}

impl RedisConfig {
    /// Create a config for the given URL with default settings
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the pool size
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.pool_size > 1000 {
            return Err("Pool size cannot exceed 1000".to_string());
        }

        #[cfg(not(feature = "redis-tls"))]
        if self.url.starts_with("rediss://") {
            return Err(
                "rediss:// URLs need the 'redis-tls' feature. \
                 Enable it with: cargo build --features redis-tls"
                    .to_string(),
            );
        }

        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    /// Default: 3
    pub max_retries: u32,

    /// Initial delay between retries
    /// Default: 50ms
    pub initial_delay: Duration,

    /// Maximum delay between retries
    /// Default: 2 seconds
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    /// Default: 2.0
    pub multiplier: f64,

    /// Add up to 25% random jitter to delays
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Counters for pool activity
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections_created: AtomicU64,
    connection_failures: AtomicU64,
    commands_executed: AtomicU64,
    command_failures: AtomicU64,
    retries: AtomicU64,
    total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_connection(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let executed = self.commands_executed.load(Ordering::Relaxed);
        let total_latency = self.total_latency_us.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands_executed: executed,
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: if executed == 0 {
                0.0
            } else {
                total_latency as f64 / executed as f64
            },
        }
    }
}

/// Snapshot of pool metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetricsSnapshot {
    /// Connections established during the pool lifetime
    pub connections_created: u64,
    /// Failed connection attempts
    pub connection_failures: u64,
    /// Commands that completed successfully
    pub commands_executed: u64,
    /// Commands that failed or timed out
    pub command_failures: u64,
    /// Retry attempts
    pub retries: u64,
    /// Average latency of successful commands in microseconds
    pub average_latency_us: f64,
}

/// Health status of the Redis connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Responding quickly
    Healthy,
    /// Responding, but slower than 100ms
    Degraded,
    /// Not responding
    Unhealthy,
    /// Not checked yet
    Unknown,
}

/// Shared multiplexed connection with bounded concurrency
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    metrics: Arc<PoolMetrics>,
    semaphore: Arc<Semaphore>,
    health_status: RwLock<HealthStatus>,
}

impl RedisPool {
    /// Connect to Redis
    ///
    /// Fails with [`Error::Configuration`] on an invalid config and
    /// [`Error::Backend`] when the server cannot be reached.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;

        let client = Client::open(config.url.as_str()).map_err(|e| backend_error(&config.url, &e))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(config.pool_size as usize)),
            metrics: Arc::new(PoolMetrics::default()),
            health_status: RwLock::new(HealthStatus::Unknown),
            config,
        };

        pool.connect().await?;
        debug!(pool_size = pool.config.pool_size, "Redis pool initialized");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        let start = Instant::now();
        let conn = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            self.metrics.record_connection_failure();
            Error::Backend(safe_message(&self.config.url, "Connection timeout"))
        })?
        .map_err(|e| {
            self.metrics.record_connection_failure();
            backend_error(&self.config.url, &e)
        })?;

        *self.connection.write().await = Some(conn.clone());
        *self.health_status.write().await = HealthStatus::Healthy;
        self.metrics.record_connection();

        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(conn)
    }

    async fn current(&self) -> Result<MultiplexedConnection> {
        let existing = self.connection.read().await.clone();
        match existing {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Run a command with timeout and retry
    ///
    /// `f` receives a fresh handle on every attempt, so it must be callable
    /// more than once.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RedisError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Backend("Redis pool closed".to_string()))?;

        let mut attempt = 0;
        loop {
            let conn = self.current().await?;
            let start = Instant::now();

            match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    self.metrics.record_command_failure();
                    if !(self.config.retry_policy.should_retry(attempt) && is_retriable_error(&e)) {
                        return Err(backend_error(&self.config.url, &e));
                    }

                    let delay = self.config.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        ?delay,
                        "Redis command failed, retrying: {}",
                        backend_error(&self.config.url, &e)
                    );
                    tokio::time::sleep(delay).await;

                    if is_connection_error(&e) {
                        *self.connection.write().await = None;
                    }
                },
                Err(_) => {
                    self.metrics.record_command_failure();
                    if !self.config.retry_policy.should_retry(attempt) {
                        return Err(Error::Backend(safe_message(
                            &self.config.url,
                            "Command timeout",
                        )));
                    }

                    let delay = self.config.retry_policy.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, "Redis command timed out, retrying");
                    tokio::time::sleep(delay).await;
                },
            }

            self.metrics.record_retry();
            attempt += 1;
        }
    }

    /// Send a PING and update the health status
    pub async fn health_check(&self) -> HealthStatus {
        let start = Instant::now();
        let result = self
            .execute(|mut conn| async move { redis::cmd("PING").query_async::<String>(&mut conn).await })
            .await;

        let status = match result {
            Ok(_) if start.elapsed() > Duration::from_millis(100) => HealthStatus::Degraded,
            Ok(_) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };

        *self.health_status.write().await = status;
        status
    }

    /// Last known health status; `Unknown` while a check holds the lock
    pub fn health_status(&self) -> HealthStatus {
        self.health_status
            .try_read()
            .map(|guard| *guard)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Pool metrics snapshot
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Errors worth another attempt
fn is_retriable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(
            e.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
}

/// Errors after which the shared connection is discarded
fn is_connection_error(e: &RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisConfig::default();
        assert_eq!(config.pool_size, 16);
        assert_eq!(config.command_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RedisConfig::with_url("").validate().is_err());
        assert!(RedisConfig::default().pool_size(0).validate().is_err());
        assert!(RedisConfig::default().pool_size(1001).validate().is_err());
        assert!(RedisConfig::default().pool_size(64).validate().is_ok());
    }

    #[cfg(not(feature = "redis-tls"))]
    #[test]
    fn test_tls_url_needs_feature() {
        let err = RedisConfig::with_url("rediss://secure:6380")
            .validate()
            .unwrap_err();
        assert!(err.contains("redis-tls"));
    }

    #[test]
    fn test_from_backend_config() {
        let backend = BackendConfig {
            redis_url: "redis://cache:6380".to_string(),
            pool_size: 8,
            command_timeout_ms: 250,
            max_retries: 0,
            ..Default::default()
        };
        let config = RedisConfig::from(&backend);
        assert_eq!(config.url, "redis://cache:6380");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert!(!config.retry_policy.should_retry(0));
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_jitter_bounded() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(0));
    }

    #[test]
    fn test_pool_metrics() {
        let metrics = PoolMetrics::default();
        metrics.record_connection();
        metrics.record_command(Duration::from_micros(100));
        metrics.record_command(Duration::from_micros(200));
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.commands_executed, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.average_latency_us, 150.0);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_error() {
        let config = RedisConfig::with_url("redis://127.0.0.1:1")
            .connection_timeout(Duration::from_millis(200))
            .retry_policy(RetryPolicy::none());
        match RedisPool::new(config).await {
            Err(Error::Backend(msg)) => assert!(msg.contains("127.0.0.1:1")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
