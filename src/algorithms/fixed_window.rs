// src/algorithms/fixed_window.rs

use super::super::algorithms::{ceil_secs, ensure_cost_fits, RateLimitAlgorithm, RateLimitStatus};
use super::super::clock::Clock;
use super::super::config::WindowConfig;
use super::super::error::{RateLimiterError, Result};
use super::super::storage::CounterStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Fixed Window rate limiting algorithm
///
/// The fixed window algorithm divides time into fixed windows (e.g., 1 minute)
/// and limits the number of requests in each window. Each window gets its own
/// counter key, so a new window starts from zero without any reset step.
///
/// Up to twice `max_requests` can be admitted in a short span that straddles a
/// window boundary.
#[derive(Debug)]
pub struct FixedWindow<S>
where
    S: CounterStore + ?Sized,
{
    /// Store holding window counters
    store: Arc<S>,

    clock: Arc<dyn Clock>,

    /// Configuration for the fixed window
    config: WindowConfig,
}

impl<S> FixedWindow<S>
where
    S: CounterStore + ?Sized,
{
    /// Creates a new fixed window with the given store and configuration
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: WindowConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Counter key and end of the window containing `now_ms`
    fn current_window(&self, key: &str, now_ms: u64) -> (String, u64) {
        let window_ms = self.config.window_ms();
        let window_id = now_ms / window_ms;
        (
            format!("fw:{}:{}", key, window_id),
            (window_id + 1) * window_ms,
        )
    }

    fn status(&self, count: u64, allowed: bool, window_end: u64, now_ms: u64) -> RateLimitStatus {
        RateLimitStatus {
            allowed,
            remaining: self.config.max_requests.saturating_sub(count),
            limit: self.config.max_requests,
            reset_at_ms: window_end,
            retry_after: (!allowed).then(|| ceil_secs(window_end - now_ms)),
        }
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for FixedWindow<S>
where
    S: CounterStore + ?Sized,
{
    async fn consume(&self, key: &str, cost: u64) -> Result<RateLimitStatus> {
        ensure_cost_fits(self.name(), cost, self.config.max_requests)?;
        let amount = i64::try_from(cost).map_err(|_| {
            RateLimiterError::Algorithm(format!("{}: cost {} out of range", self.name(), cost))
        })?;

        let now = self.clock.now_ms();
        let (counter_key, window_end) = self.current_window(key, now);

        let count = self
            .store
            .incr(&counter_key, amount, self.config.window)
            .await?
            .max(0) as u64;

        let allowed = count <= self.config.max_requests;
        Ok(self.status(count, allowed, window_end, now))
    }

    async fn check(&self, key: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now_ms();
        let (counter_key, window_end) = self.current_window(key, now);

        let count = self.store.get(&counter_key).await?.unwrap_or(0).max(0) as u64;
        let allowed = count < self.config.max_requests;
        Ok(self.status(count, allowed, window_end, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let (counter_key, _) = self.current_window(key, self.clock.now_ms());
        self.store.del(&counter_key).await?;
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.config.max_requests
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}
