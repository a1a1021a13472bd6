// src/algorithms/sliding_window.rs

use crate::algorithms::{ceil_secs, ensure_cost_fits, RateLimitAlgorithm, RateLimitStatus};
use crate::clock::Clock;
use crate::config::WindowConfig;
use crate::error::Result;
use crate::storage::CounterStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Sliding Window Log rate limiting algorithm
///
/// Every admitted unit is recorded as a sorted-set member scored by its
/// timestamp. A request is admitted when the members inside
/// `[now - window, now]` plus its cost stay within `max_requests`. Windowing is
/// exact, so there is no burst at window boundaries; the price is one entry per
/// admitted unit, bounded to `max_requests` per active key by pruning.
#[derive(Debug)]
pub struct SlidingWindow<S>
where
    S: CounterStore + ?Sized,
{
    /// Store holding the per-key logs
    store: Arc<S>,

    clock: Arc<dyn Clock>,

    /// Configuration for the sliding window
    config: WindowConfig,
}

impl<S> SlidingWindow<S>
where
    S: CounterStore + ?Sized,
{
    /// Creates a new sliding window with the given store and configuration
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

    fn storage_key(key: &str) -> String {
        format!("sw:{}", key)
    }
}

#[async_trait]
impl<S> RateLimitAlgorithm for SlidingWindow<S>
where
    S: CounterStore + ?Sized,
{
    async fn consume(&self, key: &str, cost: u64) -> Result<RateLimitStatus> {
        ensure_cost_fits(self.name(), cost, self.config.max_requests)?;

        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms();

        // members only need to be unique; the prefix keeps same-millisecond units apart
        let member_prefix = Uuid::new_v4().to_string();
        let admission = self
            .store
            .admit_window(
                &Self::storage_key(key),
                now,
                window_ms,
                self.config.max_requests,
                cost,
                &member_prefix,
            )
            .await?;

        if admission.allowed {
            Ok(RateLimitStatus {
                allowed: true,
                remaining: self
                    .config
                    .max_requests
                    .saturating_sub(admission.count.saturating_add(cost)),
                limit: self.config.max_requests,
                reset_at_ms: now + window_ms,
                retry_after: None,
            })
        } else {
            Ok(RateLimitStatus {
                allowed: false,
                remaining: 0,
                limit: self.config.max_requests,
                reset_at_ms: now + window_ms,
                retry_after: Some(ceil_secs(window_ms)),
            })
        }
    }

    async fn check(&self, key: &str) -> Result<RateLimitStatus> {
        let now = self.clock.now_ms();
        let window_ms = self.config.window_ms();

        let count = self
            .store
            .zcount(&Self::storage_key(key), now.saturating_sub(window_ms), now)
            .await?;
        let allowed = count < self.config.max_requests;

        Ok(RateLimitStatus {
            allowed,
            remaining: self.config.max_requests.saturating_sub(count),
            limit: self.config.max_requests,
            reset_at_ms: now + window_ms,
            retry_after: (!allowed).then(|| ceil_secs(window_ms)),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.store.del(&Self::storage_key(key)).await?;
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.config.max_requests
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}

/// Sliding-window throttling for callers outside the HTTP path, such as
/// background jobs. Records one unit against `key` when it fits.
pub async fn rate_limit_check(
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key: &str,
    max_requests: u64,
    window: Duration,
) -> Result<RateLimitStatus> {
    let config = WindowConfig::new(max_requests, window);
    config.validate()?;

    SlidingWindow::new(store, clock, config).consume(key, 1).await
}
