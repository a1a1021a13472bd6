// src/config/mod.rs

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimiterError, Result};
use crate::resilience::CircuitBreakerConfig;

/// Configuration for token bucket algorithm
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket holds (burst size)
    pub capacity: u64,

    /// Tokens added every `refill_interval`
    pub refill_rate: u64,

    /// Interval between refills
    #[serde(with = "duration_serde")]
    pub refill_interval: Duration,
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(RateLimiterError::Config(
                "token bucket capacity must be greater than zero".to_string(),
            ));
        }
        if self.refill_rate == 0 {
            return Err(RateLimiterError::Config(
                "token bucket refillRate must be greater than zero".to_string(),
            ));
        }
        if self.refill_interval.as_millis() == 0 {
            return Err(RateLimiterError::Config(
                "token bucket refillInterval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn interval_ms(&self) -> u64 {
        self.refill_interval.as_millis() as u64
    }
}

/// Configuration shared by the sliding window and fixed window algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowConfig {
    /// Window duration
    #[serde(rename = "windowMs", with = "duration_serde")]
    pub window: Duration,

    /// Maximum number of requests allowed in the window
    pub max_requests: u64,
}

impl WindowConfig {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.as_millis() == 0 {
            return Err(RateLimiterError::Config(
                "windowMs must be at least 1ms".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(RateLimiterError::Config(
                "maxRequests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Which algorithm an endpoint uses, together with its typed parameters.
///
/// Serialized as `{"algorithm": "token-bucket", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "config", rename_all = "kebab-case")]
pub enum AlgorithmConfig {
    TokenBucket(TokenBucketConfig),
    SlidingWindow(WindowConfig),
    FixedWindow(WindowConfig),
}

impl AlgorithmConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            AlgorithmConfig::TokenBucket(config) => config.validate(),
            AlgorithmConfig::SlidingWindow(config) | AlgorithmConfig::FixedWindow(config) => {
                config.validate()
            }
        }
    }

    /// Stable identity used to share one limiter between rules with equal settings
    pub fn cache_key(&self) -> String {
        // serializing plain numbers and strings cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    /// The number reported in `X-RateLimit-Limit`
    pub fn limit(&self) -> u64 {
        match self {
            AlgorithmConfig::TokenBucket(config) => config.capacity,
            AlgorithmConfig::SlidingWindow(config) | AlgorithmConfig::FixedWindow(config) => {
                config.max_requests
            }
        }
    }
}

/// An endpoint rule as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRuleConfig {
    #[serde(flatten)]
    pub algorithm: AlgorithmConfig,

    /// Message returned in the 429 body
    #[serde(default = "default_message")]
    pub message: String,
}

pub(crate) fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

/// Callers exempt from limiting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistConfig {
    #[serde(default)]
    pub ips: Vec<String>,

    #[serde(default)]
    pub user_ids: Vec<String>,
}

/// What to do when the limiter itself cannot answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through
    #[default]
    Open,
    /// Reject the request with 429
    Closed,
}

/// Configuration for Redis storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Connection timeout
    #[serde(default = "default_conn_timeout", with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How often the background health check pings Redis
    #[serde(default = "default_health_check_interval", with = "duration_serde")]
    pub health_check_interval: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            connection_timeout: default_conn_timeout(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

fn default_conn_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(5)
}

/// Configuration for in-memory storage backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InMemoryConfig {
    /// Maximum number of keys (counters, buckets and windows together)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Whether to use a background task for expiration
    #[serde(default = "default_use_background_task")]
    pub use_background_task: bool,

    /// How often to run the background expiration task
    #[serde(default = "default_cleanup_interval", with = "duration_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            use_background_task: default_use_background_task(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_use_background_task() -> bool {
    true
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Everything needed to pick and open a counter store
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    /// `None` selects the in-process store
    pub redis_url: Option<String>,
    pub redis: RedisConfig,
    pub memory: InMemoryConfig,
}

/// Top-level gatekeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatekeeperConfig {
    /// When false every request passes through untouched
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Shared store location; absent means in-process counters
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`. Only
    /// safe behind a proxy that overwrites those headers; otherwise callers
    /// pick their own address.
    #[serde(default)]
    pub trust_proxy: bool,

    /// Pattern to rule, in priority order
    #[serde(default)]
    pub endpoints: IndexMap<String, EndpointRuleConfig>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Upper bound on one store round trip
    #[serde(
        rename = "storeTimeoutMs",
        default = "default_store_timeout",
        with = "duration_serde"
    )]
    pub store_timeout: Duration,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub memory: InMemoryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            redis_url: None,
            whitelist: WhitelistConfig::default(),
            trust_proxy: false,
            endpoints: IndexMap::new(),
            failure_policy: FailurePolicy::default(),
            store_timeout: default_store_timeout(),
            redis: RedisConfig::default(),
            memory: InMemoryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_store_timeout() -> Duration {
    Duration::from_millis(250)
}

impl GatekeeperConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_json::from_str(json)
            .map_err(|e| RateLimiterError::Config(format!("Failed to parse rate limit config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RATE_LIMIT_ENABLED` and `REDIS_URL` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("RATE_LIMIT_ENABLED") {
            self.enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(RateLimiterError::Config(format!(
                        "RATE_LIMIT_ENABLED must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }

        if let Some(url) = lookup("REDIS_URL") {
            let url = url.trim();
            self.redis_url = if url.is_empty() {
                None
            } else {
                Some(url.to_string())
            };
        }

        Ok(())
    }

    /// Reject values that would make a limiter meaningless.
    ///
    /// Endpoint patterns are compiled (and rejected) when the rule set is built.
    pub fn validate(&self) -> Result<()> {
        for (pattern, rule) in &self.endpoints {
            rule.algorithm
                .validate()
                .map_err(|e| RateLimiterError::Config(format!("endpoint '{}': {}", pattern, e)))?;
        }

        if self.store_timeout.is_zero() {
            return Err(RateLimiterError::Config(
                "storeTimeoutMs must be greater than zero".to_string(),
            ));
        }

        if self.memory.max_entries == 0 {
            return Err(RateLimiterError::Config(
                "memory.maxEntries must be greater than zero".to_string(),
            ));
        }

        self.circuit_breaker.validate()?;

        Ok(())
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            redis_url: self.redis_url.clone(),
            redis: self.redis.clone(),
            memory: self.memory.clone(),
        }
    }
}

// Helper module to serialize/deserialize Duration as milliseconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
