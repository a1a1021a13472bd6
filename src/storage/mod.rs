// src/storage/mod.rs

pub mod memory;
pub mod redis;

#[cfg(test)]
mod tests;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::algorithms::token_bucket::BucketState;
use crate::clock::Clock;
use crate::config::{StoreSettings, TokenBucketConfig};
use crate::error::Result;

/// Outcome of an atomic token-bucket update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketAdmission {
    pub allowed: bool,
    /// Bucket state after refill and (when allowed) the deduction
    pub state: BucketState,
}

/// Outcome of an atomic sliding-window admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub allowed: bool,
    /// Entries inside the window before this call added anything
    pub count: u64,
}

/// Core trait that all counter stores must implement.
///
/// The primitive operations mirror their Redis namesakes. The compound
/// operations (`take_tokens`, `admit_window`) have default implementations
/// built from primitives; those are only as atomic as the individual calls, so
/// both shipped backends override them with a single critical section (memory)
/// or a server-side script (Redis).
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Reads an integer counter
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Unconditionally overwrites an integer with expiry
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    /// Atomically adds `amount` (creating at 0) and resets the TTL in the same step
    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64>;

    /// Sets expiration time for a key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Inserts or moves a sorted-set member
    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<()>;

    /// Removes members with `min <= score <= max`, returning how many went
    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64>;

    /// Counts members with `min <= score <= max`
    async fn zcount(&self, key: &str, min: u64, max: u64) -> Result<u64>;

    /// Deletes a key of any kind
    async fn del(&self, key: &str) -> Result<bool>;

    /// Whether the backend believes it can currently serve requests
    fn is_connected(&self) -> bool;

    /// Short name for logs
    fn backend_name(&self) -> &'static str;

    /// Reads a persisted token bucket
    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>>;

    /// Persists a token bucket with expiry
    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()>;

    /// Refills the bucket at `key`, then deducts `cost` tokens if enough are present.
    async fn take_tokens(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: u64,
        now_ms: u64,
    ) -> Result<BucketAdmission> {
        let mut state = self
            .get_bucket(key)
            .await?
            .unwrap_or_else(|| BucketState::full(config, now_ms));
        state.refill(config, now_ms);

        let allowed = state.try_take(cost);
        self.set_bucket(key, state, BucketState::ttl(config)).await?;

        Ok(BucketAdmission { allowed, state })
    }

    /// Prunes entries older than the window, counts the rest and, if `cost`
    /// more fit under `max_requests`, records them at `now_ms`.
    async fn admit_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
        cost: u64,
        member_prefix: &str,
    ) -> Result<WindowAdmission> {
        let floor = now_ms.saturating_sub(window_ms);
        if floor > 0 {
            self.zremrangebyscore(key, 0, floor - 1).await?;
        }

        let count = self.zcount(key, floor, now_ms).await?;
        if count.saturating_add(cost) > max_requests {
            return Ok(WindowAdmission {
                allowed: false,
                count,
            });
        }

        for ordinal in 0..cost {
            self.zadd(key, now_ms, &format!("{}:{}", member_prefix, ordinal))
                .await?;
        }
        if cost > 0 {
            self.expire(key, window_ttl(window_ms)).await?;
        }

        Ok(WindowAdmission {
            allowed: true,
            count,
        })
    }
}

/// Lifetime of a sliding-window set after its newest entry. One millisecond
/// past the window, since an entry exactly `window_ms` old is still counted.
pub(crate) fn window_ttl(window_ms: u64) -> Duration {
    Duration::from_millis(window_ms.saturating_add(1))
}

/// Opens the store described by `settings`.
///
/// Without a Redis URL the in-process store is used. When Redis is configured
/// but unreachable the in-process store is used instead and a warning is
/// logged; limiting keeps working per instance rather than failing startup.
pub async fn connect(settings: &StoreSettings, clock: Arc<dyn Clock>) -> Arc<dyn CounterStore> {
    let url = match settings.redis_url.as_deref() {
        Some(url) => url,
        None => {
            info!("No Redis URL configured, using in-memory rate limit store");
            return Arc::new(MemoryStore::new(settings.memory.clone(), clock));
        }
    };

    match RedisStore::new(url, settings.redis.clone()).await {
        Ok(store) => {
            info!(url = %url, "Connected to Redis rate limit store");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                url = %url,
                error = %e,
                "Redis unavailable, falling back to in-memory rate limit store"
            );
            Arc::new(MemoryStore::new(settings.memory.clone(), clock))
        }
    }
}
