// src/storage/memory.rs

// In-memory counter store (for tests, single-instance deployments and Redis fallback)
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use crate::algorithms::token_bucket::BucketState;
use crate::clock::Clock;
use crate::config::{InMemoryConfig, TokenBucketConfig};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::storage::{window_ttl, BucketAdmission, CounterStore, WindowAdmission};

/// Value held under a scalar key
#[derive(Debug, Clone, Copy)]
enum Value {
    Int(i64),
    Bucket(BucketState),
}

#[derive(Debug)]
struct ScalarEntry {
    value: Value,
    expires_at: Option<u64>,
}

/// Sorted set of members ordered by score, then member
#[derive(Debug, Default)]
struct SortedSet {
    by_member: HashMap<String, u64>,
    by_score: BTreeSet<(u64, String)>,
    expires_at: Option<u64>,
}

impl SortedSet {
    fn insert(&mut self, score: u64, member: String) {
        if let Some(old) = self.by_member.insert(member.clone(), score) {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    fn in_range(&self, min: u64, max: u64) -> impl Iterator<Item = &(u64, String)> {
        self.by_score
            .range((min, String::new())..)
            .take_while(move |(score, _)| *score <= max)
    }

    fn count(&self, min: u64, max: u64) -> u64 {
        if min > max {
            return 0;
        }
        self.in_range(min, max).count() as u64
    }

    fn remove_range(&mut self, min: u64, max: u64) -> u64 {
        if min > max {
            return 0;
        }
        let doomed: Vec<(u64, String)> = self.in_range(min, max).cloned().collect();
        for entry in &doomed {
            self.by_score.remove(entry);
            self.by_member.remove(&entry.1);
        }
        doomed.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.by_score.is_empty()
    }
}

fn is_expired(expires_at: Option<u64>, now_ms: u64) -> bool {
    expires_at.is_some_and(|at| at <= now_ms)
}

fn deadline(now_ms: u64, ttl: Duration) -> Option<u64> {
    Some(now_ms.saturating_add(ttl.as_millis() as u64))
}

fn wrong_type(key: &str) -> RateLimiterError {
    StorageError::Serialization(format!("key '{}' holds a different kind of value", key)).into()
}

#[derive(Debug, Default)]
struct Inner {
    scalars: HashMap<String, ScalarEntry>,
    sets: HashMap<String, SortedSet>,
}

impl Inner {
    fn len(&self) -> usize {
        self.scalars.len() + self.sets.len()
    }

    fn contains(&self, key: &str) -> bool {
        self.scalars.contains_key(key) || self.sets.contains_key(key)
    }

    /// Drops `key` if its deadline has passed
    fn evict_if_expired(&mut self, key: &str, now_ms: u64) {
        if self
            .scalars
            .get(key)
            .is_some_and(|entry| is_expired(entry.expires_at, now_ms))
        {
            self.scalars.remove(key);
        }
        if self
            .sets
            .get(key)
            .is_some_and(|set| is_expired(set.expires_at, now_ms))
        {
            self.sets.remove(key);
        }
    }

    fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.len();
        self.scalars
            .retain(|_, entry| !is_expired(entry.expires_at, now_ms));
        self.sets.retain(|_, set| !is_expired(set.expires_at, now_ms));
        before - self.len()
    }

    /// Fails when `key` is new and the store is full even after purging
    fn ensure_room(&mut self, key: &str, now_ms: u64, max_entries: usize) -> Result<()> {
        if self.contains(key) || self.len() < max_entries {
            return Ok(());
        }
        self.purge_expired(now_ms);
        if self.len() < max_entries {
            Ok(())
        } else {
            Err(StorageError::CapacityExceeded(max_entries).into())
        }
    }

    fn scalar(&mut self, key: &str, now_ms: u64) -> Result<Option<&mut ScalarEntry>> {
        self.evict_if_expired(key, now_ms);
        if self.sets.contains_key(key) {
            return Err(wrong_type(key));
        }
        Ok(self.scalars.get_mut(key))
    }

    fn sorted_set(&mut self, key: &str, now_ms: u64) -> Result<Option<&mut SortedSet>> {
        self.evict_if_expired(key, now_ms);
        if self.scalars.contains_key(key) {
            return Err(wrong_type(key));
        }
        Ok(self.sets.get_mut(key))
    }

    fn bucket(&mut self, key: &str, now_ms: u64) -> Result<Option<BucketState>> {
        match self.scalar(key, now_ms)? {
            Some(ScalarEntry {
                value: Value::Bucket(state),
                ..
            }) => Ok(Some(*state)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.sets.get(key).is_some_and(SortedSet::is_empty) {
            self.sets.remove(key);
        }
    }
}

/// In-process counter store.
///
/// All state sits behind one lock, which makes every operation, including the
/// compound ones, atomic with respect to every other. Expired keys are dropped
/// lazily on access and by a periodic sweep.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
    config: InMemoryConfig,
}

impl MemoryStore {
    /// Creates a new in-memory store with the given configuration.
    ///
    /// The sweep task only starts when called inside a Tokio runtime, and it
    /// stops once the last clone of the store is dropped.
    pub fn new(config: InMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));

        if config.use_background_task && !config.cleanup_interval.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(Self::sweep_loop(
                    Arc::downgrade(&inner),
                    Arc::clone(&clock),
                    config.cleanup_interval,
                ));
            }
        }

        Self {
            inner,
            clock,
            config,
        }
    }

    async fn sweep_loop(inner: Weak<Mutex<Inner>>, clock: Arc<dyn Clock>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let removed = inner.lock().purge_expired(clock.now_ms());
            if removed > 0 {
                debug!(removed, "Swept expired rate limit entries");
            }
        }
    }

    /// Removes every expired key now, returning how many went
    pub fn sweep_expired(&self) -> usize {
        self.inner.lock().purge_expired(self.clock.now_ms())
    }

    /// Number of keys held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.config
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        match inner.scalar(key, now)? {
            Some(ScalarEntry {
                value: Value::Int(value),
                ..
            }) => Ok(Some(*value)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.evict_if_expired(key, now);
        inner.ensure_room(key, now, self.config.max_entries)?;

        inner.sets.remove(key);
        inner.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: Value::Int(value),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.scalar(key, now)? {
            let Value::Int(current) = entry.value else {
                return Err(wrong_type(key));
            };
            let updated = current.saturating_add(amount);
            entry.value = Value::Int(updated);
            entry.expires_at = deadline(now, ttl);
            return Ok(updated);
        }

        inner.ensure_room(key, now, self.config.max_entries)?;
        inner.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: Value::Int(amount),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(amount)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.evict_if_expired(key, now);

        if let Some(entry) = inner.scalars.get_mut(key) {
            entry.expires_at = deadline(now, ttl);
            Ok(true)
        } else if let Some(set) = inner.sets.get_mut(key) {
            set.expires_at = deadline(now, ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        if inner.sorted_set(key, now)?.is_none() {
            inner.ensure_room(key, now, self.config.max_entries)?;
        }
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(score, member.to_string());
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let removed = match inner.sorted_set(key, now)? {
            Some(set) => set.remove_range(min, max),
            None => 0,
        };
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn zcount(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        Ok(inner
            .sorted_set(key, now)?
            .map_or(0, |set| set.count(min, max)))
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let scalar = inner.scalars.remove(key).is_some();
        let set = inner.sets.remove(key).is_some();
        Ok(scalar || set)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let now = self.clock.now_ms();
        self.inner.lock().bucket(key, now)
    }

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.evict_if_expired(key, now);
        inner.ensure_room(key, now, self.config.max_entries)?;

        inner.sets.remove(key);
        inner.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: Value::Bucket(state),
                expires_at: deadline(now, ttl),
            },
        );
        Ok(())
    }

    async fn take_tokens(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: u64,
        now_ms: u64,
    ) -> Result<BucketAdmission> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let existing = inner.bucket(key, now)?;
        if existing.is_none() {
            inner.ensure_room(key, now, self.config.max_entries)?;
        }

        let mut state = existing.unwrap_or_else(|| BucketState::full(config, now_ms));
        state.refill(config, now_ms);
        let allowed = state.try_take(cost);

        inner.scalars.insert(
            key.to_string(),
            ScalarEntry {
                value: Value::Bucket(state),
                expires_at: deadline(now, BucketState::ttl(config)),
            },
        );

        Ok(BucketAdmission { allowed, state })
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
        let now = self.clock.now_ms();
        let floor = now_ms.saturating_sub(window_ms);
        let mut inner = self.inner.lock();

        let count = match inner.sorted_set(key, now)? {
            Some(set) => {
                if floor > 0 {
                    set.remove_range(0, floor - 1);
                }
                set.count(floor, now_ms)
            }
            None => 0,
        };
        inner.drop_if_empty(key);

        if count.saturating_add(cost) > max_requests {
            return Ok(WindowAdmission {
                allowed: false,
                count,
            });
        }

        if cost > 0 {
            inner.ensure_room(key, now, self.config.max_entries)?;
            let set = inner.sets.entry(key.to_string()).or_default();
            for ordinal in 0..cost {
                set.insert(now_ms, format!("{}:{}", member_prefix, ordinal));
            }
            set.expires_at = deadline(now, window_ttl(window_ms));
        }

        Ok(WindowAdmission {
            allowed: true,
            count,
        })
    }
}
