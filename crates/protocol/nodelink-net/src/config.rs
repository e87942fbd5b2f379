//! Network configuration.
//!
//! This module defines configuration options for connections, consumers
//! and health checks.

use nodelink_types::constants::{
    CONSUMER_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_WORKER_POOL_SIZE,
    HANDSHAKE_TIMEOUT_MS, HEALTH_CHECK_FAILURE_LIMIT, HEALTH_CHECK_INTERVAL_MS,
    HEALTH_CHECK_MAX_JITTER_MS, HEALTH_CHECK_TIMEOUT_MS, MAX_FRAME_SIZE, MESSAGE_TTL_MS,
    SLOW_DISPATCH_THRESHOLD_MS,
};
use std::time::Duration;

/// Configuration for the network layer.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Time allowed for a handshake to complete.
    ///
    /// Default: 15 seconds.
    pub handshake_timeout: Duration,

    /// Default timeout for request/response exchanges.
    ///
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Time-to-live of every message put on a queue.
    ///
    /// Default: 60 seconds.
    pub message_ttl: Duration,

    /// How long a consumer blocks on one receive before looping.
    ///
    /// Default: 1 second.
    pub consumer_poll_interval: Duration,

    /// Dispatches slower than this are logged.
    ///
    /// Default: 2 seconds.
    pub slow_dispatch_threshold: Duration,

    /// Maximum number of concurrently running dispatch tasks.
    ///
    /// Default: 64.
    pub worker_pool_size: usize,

    /// Largest accepted broker frame in bytes.
    ///
    /// Default: 10 MB.
    pub max_frame_size: usize,

    /// Health-check settings.
    pub health_check: HealthCheckConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            message_ttl: Duration::from_millis(MESSAGE_TTL_MS),
            consumer_poll_interval: Duration::from_millis(CONSUMER_POLL_INTERVAL_MS),
            slow_dispatch_threshold: Duration::from_millis(SLOW_DISPATCH_THRESHOLD_MS),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the message time-to-live.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Set the consumer poll interval.
    pub fn with_consumer_poll_interval(mut self, interval: Duration) -> Self {
        self.consumer_poll_interval = interval;
        self
    }

    /// Set the worker pool size. Zero is raised to one.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    /// Replace the health-check settings.
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }
}

/// Periodic connection health checks.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Whether the periodic task runs at all.
    pub enabled: bool,

    /// Period between rounds.
    ///
    /// Default: 15 seconds.
    pub interval: Duration,

    /// Upper bound of the random delay before each check.
    ///
    /// Default: 9 seconds.
    pub max_jitter: Duration,

    /// Timeout of one check request.
    ///
    /// Default: 5 seconds.
    pub timeout: Duration,

    /// Consecutive failures after which a connection is declared broken.
    ///
    /// Default: 3.
    pub failure_limit: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(HEALTH_CHECK_INTERVAL_MS),
            max_jitter: Duration::from_millis(HEALTH_CHECK_MAX_JITTER_MS),
            timeout: Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS),
            failure_limit: HEALTH_CHECK_FAILURE_LIMIT,
        }
    }
}

impl HealthCheckConfig {
    /// Health checks switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the per-check timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum jitter.
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Set the failure limit. Zero is raised to one.
    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.failure_limit = limit.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();

        assert_eq!(config.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.message_ttl, Duration::from_secs(60));
        assert_eq!(config.consumer_poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker_pool_size, 64);
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_health_check_defaults() {
        let hc = HealthCheckConfig::default();
        assert!(hc.enabled);
        assert_eq!(hc.interval, Duration::from_secs(15));
        assert_eq!(hc.max_jitter, Duration::from_secs(9));
        assert_eq!(hc.timeout, Duration::from_secs(5));
        assert_eq!(hc.failure_limit, 3);
        assert!(!HealthCheckConfig::disabled().enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = NetworkConfig::new()
            .with_handshake_timeout(Duration::from_millis(200))
            .with_request_timeout(Duration::from_secs(5))
            .with_message_ttl(Duration::from_secs(10))
            .with_worker_pool_size(0)
            .with_health_check(HealthCheckConfig::disabled().with_failure_limit(0).with_max_jitter(Duration::ZERO));

        assert_eq!(config.handshake_timeout, Duration::from_millis(200));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.message_ttl, Duration::from_secs(10));
        assert_eq!(config.worker_pool_size, 1);
        assert!(!config.health_check.enabled);
        assert_eq!(config.health_check.failure_limit, 1);
        assert_eq!(config.health_check.max_jitter, Duration::ZERO);
    }
}
