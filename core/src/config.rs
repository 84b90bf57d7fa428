//! Service configuration
//!
//! Deserializable configuration for every pipeline component, with defaults
//! mirroring the documented service constants. Loading (files, env, flags)
//! belongs to the embedding process; this module only defines the shape and
//! validates it. Validation failures are fatal at init.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{CircuitBreakerPolicy, RateLimitPolicy};
use crate::retry::RetryPolicy;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub feed: FeedConfig,
    pub cursor: CursorConfig,
    pub dispatcher: DispatcherConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub dlq: DlqConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service identity; keys the cursor record and tags outbound requests
    pub name: String,
    /// User-Agent header on deliveries
    pub user_agent: String,
    /// Grace period for draining in-flight deliveries on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "webhook-service".to_string(),
            user_agent: "tracklane-webhooks/0.1".to_string(),
            shutdown_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Base reconnect delay after a feed error
    pub reconnect_base_delay_ms: u64,
    /// Cap on the exponential reconnect delay
    pub reconnect_max_delay_ms: u64,
    /// Consecutive reconnect failures tolerated before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Buffered saves flush after this interval
    pub save_interval_ms: u64,
    /// Background flush period for anything still pending
    pub periodic_save_ms: u64,
    /// Bounded history of prior positions kept for rollback
    pub max_history: usize,
    /// File path for the file-backed store
    pub file_path: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 5_000,
            periodic_save_ms: 30_000,
            max_history: 100,
            file_path: "data/resume-cursor.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Default retry policy for subscribers without an override
    pub retry: RetryPolicy,
    /// Per-attempt request timeout
    pub request_timeout_ms: u64,
    /// Response bodies beyond this many bytes abort the transfer
    pub max_response_bytes: usize,
    /// Response body bytes retained on the persisted attempt
    pub response_capture_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout_ms: 30_000,
            max_response_bytes: 256 * 1024,
            response_capture_bytes: 4 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global limiter, checked before any per-subscriber limiter
    pub global_enabled: bool,
    pub global: RateLimitPolicy,
    /// Default per-subscriber policy when the subscriber has none
    pub subscriber_default: Option<RateLimitPolicy>,
    /// Limiters idle longer than this are reclaimed by the sweep
    pub idle_reclaim_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_enabled: true,
            global: RateLimitPolicy {
                max_requests: 1_000,
                ..RateLimitPolicy::default()
            },
            subscriber_default: None,
            idle_reclaim_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Oldest entries are trimmed beyond this size
    pub max_size: usize,
    /// Entries older than this are expired by the sweep
    pub retention_ms: u64,
    /// How often the expiry sweep runs
    pub sweep_interval_ms: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            retention_ms: 30 * 24 * 60 * 60 * 1_000,
            sweep_interval_ms: 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Records older than this are dropped by the retention sweep
    pub retention_ms: u64,
    /// Payloads at or above this size are stored with the compressed flag
    pub compress_threshold_bytes: usize,
    pub sweep_interval_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_ms: 90 * 24 * 60 * 60 * 1_000,
            compress_threshold_bytes: 16 * 1024,
            sweep_interval_ms: 60 * 60 * 1_000,
        }
    }
}

impl Config {
    /// Validate the configuration. Any error here is fatal at init.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "service.name".to_string(),
            });
        }
        if self.feed.max_reconnect_attempts == 0 {
            return Err(ConfigError::invalid(
                "feed.max_reconnect_attempts",
                "must be at least 1",
            ));
        }
        if self.feed.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "feed.reconnect_base_delay_ms",
                "must be non-zero",
            ));
        }
        if self.cursor.save_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "cursor.save_interval_ms",
                "must be non-zero",
            ));
        }
        if self.cursor.file_path.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "cursor.file_path".to_string(),
            });
        }
        if self.dispatcher.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.dispatcher.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "dispatcher.retry.multiplier",
                "must be >= 1.0",
            ));
        }
        if self.dispatcher.max_response_bytes == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.max_response_bytes",
                "must be non-zero",
            ));
        }
        if self.circuit_breaker.monitoring_period_ms == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.monitoring_period_ms",
                "must be non-zero",
            ));
        }
        if !(0.0..=100.0).contains(&self.circuit_breaker.error_threshold) {
            return Err(ConfigError::invalid(
                "circuit_breaker.error_threshold",
                "must be a percentage between 0 and 100",
            ));
        }
        if !(0.0..=100.0).contains(&self.circuit_breaker.slow_call_rate_threshold) {
            return Err(ConfigError::invalid(
                "circuit_breaker.slow_call_rate_threshold",
                "must be a percentage between 0 and 100",
            ));
        }
        if self.dlq.max_size == 0 {
            return Err(ConfigError::invalid("dlq.max_size", "must be non-zero"));
        }
        Ok(())
    }
}
