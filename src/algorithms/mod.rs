// src/algorithms/mod.rs

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

#[cfg(test)]
mod tests;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use super::error::{RateLimiterError, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::AlgorithmConfig;
use crate::storage::CounterStore;

/// Status returned by rate limiting operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Whether the request was allowed
    pub allowed: bool,

    /// Remaining allowed requests (never negative)
    pub remaining: u64,

    /// Total capacity of the rate limiter
    pub limit: u64,

    /// When the limit resets, in epoch milliseconds; never earlier than the decision time
    pub reset_at_ms: u64,

    /// Seconds until the rejected request could succeed
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    /// `reset_at_ms` rounded up to whole epoch seconds, as sent in `X-RateLimit-Reset`
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Time from `now_ms` until `reset_at_ms`
    pub fn reset_after(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
    }
}

/// Core trait that all rate limiting algorithms must implement.
///
/// Limiters keep no per-key state of their own; everything lives in the
/// [`CounterStore`] they were built with.
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync + Debug {
    /// Records `cost` units against `key` if they fit, and reports the outcome.
    ///
    /// A `cost` above [`limit`](Self::limit) can never fit and is an
    /// [`RateLimiterError::Algorithm`] error rather than a rejection.
    async fn consume(&self, key: &str, cost: u64) -> Result<RateLimitStatus>;

    /// Reports whether one more unit would fit, without recording anything
    async fn check(&self, key: &str) -> Result<RateLimitStatus>;

    /// Forgets everything recorded for `key`
    async fn reset(&self, key: &str) -> Result<()>;

    /// The configured maximum
    fn limit(&self) -> u64;

    /// Algorithm name for logs
    fn name(&self) -> &'static str;
}

/// Builds the limiter described by `config` on top of `store`.
pub fn build(
    config: &AlgorithmConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RateLimitAlgorithm> {
    match config {
        AlgorithmConfig::TokenBucket(config) => Arc::new(TokenBucket::new(store, clock, *config)),
        AlgorithmConfig::SlidingWindow(config) => {
            Arc::new(SlidingWindow::new(store, clock, *config))
        }
        AlgorithmConfig::FixedWindow(config) => Arc::new(FixedWindow::new(store, clock, *config)),
    }
}

/// Ceiling of `millis / 1000`
pub(crate) fn ceil_secs(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

/// Fails when `cost` exceeds what a limiter of size `limit` could ever admit
pub(crate) fn ensure_cost_fits(name: &str, cost: u64, limit: u64) -> Result<()> {
    if cost > limit {
        return Err(RateLimiterError::Algorithm(format!(
            "{}: cost {} exceeds limit {}",
            name, cost, limit
        )));
    }
    Ok(())
}
