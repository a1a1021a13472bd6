// src/test_utils.rs

use super::algorithms::token_bucket::BucketState;
use super::algorithms::RateLimitAlgorithm;
use super::clock::{Clock, ManualClock};
use super::config::{InMemoryConfig, TokenBucketConfig};
use super::error::{RateLimiterError, Result, StorageError};
use super::storage::{BucketAdmission, CounterStore, MemoryStore, WindowAdmission};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed starting instant for manual clocks in tests
pub const TEST_EPOCH_MS: u64 = 1_700_000_000_000;

/// A manual clock plus a memory store reading it
pub fn memory_store_with_clock() -> (Arc<MemoryStore>, ManualClock) {
    let clock = ManualClock::new(TEST_EPOCH_MS);
    let store = MemoryStore::new(
        InMemoryConfig {
            max_entries: 10_000,
            use_background_task: false,
            cleanup_interval: Duration::from_secs(60),
        },
        Arc::new(clock.clone()),
    );
    (Arc::new(store), clock)
}

const HEALTHY: u8 = 0;
const FAILING: u8 = 1;
const STALLING: u8 = 2;

/// Store wrapper that can be told to fail or hang, for exercising failure handling
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    mode: AtomicU8,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            mode: AtomicU8::new(HEALTHY),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self) {
        self.mode.store(HEALTHY, Ordering::SeqCst);
    }

    /// Every call returns a connection error
    pub fn set_failing(&self) {
        self.mode.store(FAILING, Ordering::SeqCst);
    }

    /// Every call hangs for a minute before answering
    pub fn set_stalling(&self) {
        self.mode.store(STALLING, Ordering::SeqCst);
    }

    /// Number of calls that reached the store
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode.load(Ordering::SeqCst) {
            FAILING => Err(RateLimiterError::Storage(StorageError::RedisConnection(
                "simulated outage".to_string(),
            ))),
            STALLING => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.enter().await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        self.enter().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        self.enter().await?;
        self.inner.incr(key, amount, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.enter().await?;
        self.inner.expire(key, ttl).await
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<()> {
        self.enter().await?;
        self.inner.zadd(key, score, member).await
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        self.enter().await?;
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn zcount(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        self.enter().await?;
        self.inner.zcount(key, min, max).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.enter().await?;
        self.inner.del(key).await
    }

    fn is_connected(&self) -> bool {
        self.mode.load(Ordering::SeqCst) == HEALTHY
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        self.enter().await?;
        self.inner.get_bucket(key).await
    }

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()> {
        self.enter().await?;
        self.inner.set_bucket(key, state, ttl).await
    }

    async fn take_tokens(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: u64,
        now_ms: u64,
    ) -> Result<BucketAdmission> {
        self.enter().await?;
        self.inner.take_tokens(key, config, cost, now_ms).await
    }

    async fn admit_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
        cost: u64,
        member_prefix: &str,
    ) -> Result<WindowAdmission> {
        self.enter().await?;
        self.inner
            .admit_window(key, now_ms, window_ms, max_requests, cost, member_prefix)
            .await
    }
}

/// A flaky store plus the manual clock its inner memory store reads
pub fn flaky_store_with_clock() -> (Arc<FlakyStore>, ManualClock) {
    let (memory, clock) = memory_store_with_clock();
    (Arc::new(FlakyStore::new((*memory).clone())), clock)
}

/// Sends `request_count` unit requests for `key`, advancing `clock` by `step`
/// after each one, and returns how many were admitted.
pub async fn count_admitted<A>(
    limiter: &A,
    clock: &ManualClock,
    key: &str,
    request_count: usize,
    step: Duration,
) -> usize
where
    A: RateLimitAlgorithm + ?Sized,
{
    let mut allowed_count = 0;

    for _ in 0..request_count {
        if limiter.consume(key, 1).await.unwrap().allowed {
            allowed_count += 1;
        }
        clock.advance(step);
    }

    allowed_count
}

/// Shared handle to a manual clock
pub fn shared(clock: &ManualClock) -> Arc<dyn Clock> {
    Arc::new(clock.clone())
}
