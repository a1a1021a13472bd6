// src/algorithms/token_bucket.rs

use crate::algorithms::{ceil_secs, ensure_cost_fits, RateLimitAlgorithm, RateLimitStatus};
use crate::clock::Clock;
use crate::config::TokenBucketConfig;
use crate::error::Result;
use crate::storage::CounterStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Persisted state of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, in `[0, capacity]`
    pub tokens: f64,

    /// Epoch milliseconds of the last whole refill interval credited
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A bucket seen for the first time
    pub fn full(config: &TokenBucketConfig, now_ms: u64) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Credits every whole interval elapsed since `last_refill_ms`.
    ///
    /// `last_refill_ms` only moves by whole intervals so the partial interval
    /// in progress still counts toward the next refill.
    pub fn refill(&mut self, config: &TokenBucketConfig, now_ms: u64) {
        let interval = config.interval_ms();
        let intervals = now_ms.saturating_sub(self.last_refill_ms) / interval;
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(config.refill_rate) as f64;
        self.tokens = (self.tokens + added).min(config.capacity as f64);
        self.last_refill_ms += intervals * interval;
    }

    /// Deducts `cost` tokens if they are all available
    pub fn try_take(&mut self, cost: u64) -> bool {
        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Whole intervals needed before `wanted` tokens are available
    pub fn intervals_until(&self, config: &TokenBucketConfig, wanted: f64) -> u64 {
        let deficit = wanted - self.tokens;
        if deficit <= 0.0 {
            return 0;
        }
        (deficit / config.refill_rate as f64).ceil() as u64
    }

    /// Epoch milliseconds at which the bucket is back to full capacity
    pub fn full_at_ms(&self, config: &TokenBucketConfig) -> u64 {
        let intervals = self.intervals_until(config, config.capacity as f64);
        self.last_refill_ms + intervals * config.interval_ms()
    }

    /// How long an untouched bucket needs to be kept; after that it would be full anyway
    pub fn ttl(config: &TokenBucketConfig) -> Duration {
        let intervals = config.capacity.div_ceil(config.refill_rate) + 1;
        Duration::from_millis(intervals.saturating_mul(config.interval_ms()))
    }
}

/// Token Bucket rate limiting algorithm
///
/// The token bucket algorithm works by maintaining a "bucket" of tokens that are
/// replenished at a constant rate. Each request consumes tokens, and if there
/// are not enough available, the request is rejected. Bursts up to `capacity`
/// are admitted immediately.
///
/// `reset_at_ms` reports when the bucket will be full again, while
/// `retry_after` reports when the rejected request itself could succeed.
#[derive(Debug)]
pub struct TokenBucket<S>
where
    S: CounterStore + ?Sized,
{
    /// Store holding bucket state
    store: Arc<S>,

    clock: Arc<dyn Clock>,

    /// Configuration for the token bucket
    config: TokenBucketConfig,
}

impl<S> TokenBucket<S>
where
    S: CounterStore + ?Sized,
{
    /// Creates a new token bucket with the given store and configuration
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: TokenBucketConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    fn storage_key(key: &str) -> String {
        format!("tb:{}", key)
    }

    fn status(&self, allowed: bool, state: &BucketState, wanted: u64, now_ms: u64) -> RateLimitStatus {
        let retry_after = if allowed {
            None
        } else {
            let intervals = state.intervals_until(&self.config, wanted as f64);
            Some(ceil_secs(intervals * self.config.interval_ms()).max(1))
        };

        RateLimitStatus {
            allowed,
            remaining: state.tokens.max(0.0).floor() as u64,
            limit: self.config.capacity,
            reset_at_ms: state.full_at_ms(&self.config).max(now_ms),
            retry_after,
        }
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for TokenBucket<S>
where
    S: CounterStore + ?Sized,
{
    async fn consume(&self, key: &str, cost: u64) -> Result<RateLimitStatus> {
        ensure_cost_fits(self.name(), cost, self.config.capacity)?;

        let now = self.clock.now_ms();
        let admission = self
            .store
            .take_tokens(&Self::storage_key(key), &self.config, cost, now)
            .await?;

        Ok(self.status(admission.allowed, &admission.state, cost, now))
    }

    async fn check(&self, key: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now_ms();
        let mut state = self
            .store
            .get_bucket(&Self::storage_key(key))
            .await?
            .unwrap_or_else(|| BucketState::full(&self.config, now));
        state.refill(&self.config, now);

        let allowed = state.tokens >= 1.0;
        Ok(self.status(allowed, &state, 1, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.store.del(&Self::storage_key(key)).await?;
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.config.capacity
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}
