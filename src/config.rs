use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine-wide configuration.
///
/// Every field has a default, and the struct deserialises with
/// `#[serde(default)]`, so a host application can override any subset of it
/// from its own configuration source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of workers executing delivery attempts. This is the outbound
    /// concurrency ceiling.
    pub worker_count: usize,

    /// Capacity of the ready queue feeding the workers.
    pub queue_capacity: usize,

    /// Number of event ids remembered for dispatch deduplication.
    pub dedup_capacity: usize,

    /// Timeout for a single outbound HTTP call.
    pub http_timeout: Duration,

    /// `User-Agent` sent with every delivery.
    pub user_agent: String,

    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_capacity: 1_000,
            dedup_capacity: 100_000,
            http_timeout: Duration::from_secs(10),
            user_agent: concat!("webhook-delivery/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::invalid("http_timeout", "must be non-zero"));
        }
        self.retry.validate()?;
        self.circuit.validate()?;
        self.rate_limit.validate()
    }
}

/// Exponential backoff applied to transient delivery failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for the deterministic part of the delay.
    pub max_delay: Duration,

    /// Maximum number of network attempts before a delivery is abandoned.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10 * 60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_delay, max_attempts }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid("retry.base_delay", "must not exceed retry.max_delay"));
        }
        Ok(())
    }
}

/// Circuit breaker thresholds and cooldowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that trip a closed circuit.
    pub failure_threshold: u32,

    /// Cooldown after the first trip. Doubles on each consecutive trip.
    pub cooldown_base: Duration,

    /// Upper bound for the cooldown.
    pub cooldown_cap: Duration,

    /// Whether HTTP 429 responses count as endpoint failures.
    pub count_rate_limit_responses: bool,

    /// Whether 4xx responses (other than 429) count as endpoint failures.
    pub count_client_errors: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_base: Duration::from_secs(60),
            cooldown_cap: Duration::from_secs(15 * 60),
            count_rate_limit_responses: true,
            count_client_errors: false,
        }
    }
}

impl CircuitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit.failure_threshold", "must be at least 1"));
        }
        if self.cooldown_base > self.cooldown_cap {
            return Err(ConfigError::invalid(
                "circuit.cooldown_base",
                "must not exceed circuit.cooldown_cap",
            ));
        }
        Ok(())
    }
}

/// Per-subscription token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub burst: u32,

    /// Tokens added per second.
    pub refill_per_sec: f64,

    /// Fixed delay before retrying a rate-limited attempt.
    pub retry_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            refill_per_sec: 1.0,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl RateLimitConfig {
    pub fn new(burst: u32, refill_per_sec: f64) -> Self {
        Self { burst, refill_per_sec, ..Self::default() }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.burst == 0 {
            return Err(ConfigError::invalid("rate_limit.burst", "must be at least 1"));
        }
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return Err(ConfigError::invalid("rate_limit.refill_per_sec", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.http_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let config = EngineConfig::default().with_retry(RetryPolicy::new(
            Duration::from_secs(10),
            Duration::from_secs(1),
            3,
        ));
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "retry.base_delay");
    }

    #[test]
    fn rejects_zero_refill() {
        let config = EngineConfig::default().with_rate_limit(RateLimitConfig::new(5, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_overrides_deserialize() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"worker_count": 3, "circuit": {"failure_threshold": 2}}"#)
                .unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.circuit.failure_threshold, 2);
        assert_eq!(config.circuit.cooldown_base, Duration::from_secs(60));
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
