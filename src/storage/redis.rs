// src/storage/redis.rs

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::algorithms::token_bucket::BucketState;
use crate::config::{RedisConfig, TokenBucketConfig};
use crate::error::{RateLimiterError, Result, StorageError};
use crate::resilience::{HealthCheckConfig, HealthChecker, HealthCheck};
use crate::storage::{BucketAdmission, CounterStore, WindowAdmission};
use crate::storage_op;

/// Refill, take and persist a bucket in one server-side step.
///
/// KEYS[1] bucket hash; ARGV capacity, refill_rate, interval_ms, cost, now_ms, ttl_ms.
/// Returns {allowed, tokens, last_refill}.
const TAKE_TOKENS_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

if now > last_refill then
  local intervals = math.floor((now - last_refill) / interval)
  if intervals > 0 then
    tokens = math.min(capacity, tokens + intervals * refill_rate)
    last_refill = last_refill + intervals * interval
  end
end

local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', string.format('%d', last_refill))
redis.call('PEXPIRE', key, ttl)
return {allowed, tostring(tokens), last_refill}
"#;

/// Prune, count and conditionally record in one server-side step.
///
/// KEYS[1] sorted set; ARGV now_ms, floor_ms, window_ms, max_requests, cost, member_prefix.
/// Returns {allowed, count_before}.
const ADMIT_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local floor = ARGV[2]
local window = tonumber(ARGV[3])
local max_requests = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])
local prefix = ARGV[6]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. floor)
local count = redis.call('ZCOUNT', key, floor, now)
if count + cost > max_requests then
  return {0, count}
end

for i = 0, cost - 1 do
  redis.call('ZADD', key, now, prefix .. ':' .. i)
end
if cost > 0 then
  redis.call('PEXPIRE', key, window + 1)
end
return {1, count}
"#;

/// Answers the background health check with a PING
struct RedisPing {
    connection: ConnectionManager,
}

#[async_trait]
impl HealthCheck for RedisPing {
    async fn check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(RateLimiterError::Storage(StorageError::RedisCommand(
                format!("Unexpected response from Redis PING: {}", pong),
            )))
        }
    }
}

/// Counter store shared between gatekeeper instances through Redis.
///
/// `ConnectionManager` multiplexes and reconnects on its own, so every call
/// works on a clone of it instead of holding a lock.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    connected: Arc<AtomicBool>,
    health: Arc<HealthChecker<RedisPing>>,
    take_tokens_script: Arc<Script>,
    admit_window_script: Arc<Script>,
    url: String,
    config: RedisConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisStore {
    /// Connects to `url`, failing if Redis does not answer within the connection timeout.
    pub async fn new(url: &str, config: RedisConfig) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| RateLimiterError::Storage(StorageError::RedisConnection(e.to_string())))?;

        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.connection_timeout)
            .set_response_timeout(config.connection_timeout)
            .set_number_of_retries(1);

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        {
            Ok(result) => result.map_err(|e| {
                RateLimiterError::Storage(StorageError::RedisConnection(e.to_string()))
            })?,
            Err(_) => {
                return Err(RateLimiterError::Storage(StorageError::RedisConnection(
                    format!(
                        "Connection to Redis at {} timed out after {:?}",
                        url, config.connection_timeout
                    ),
                )));
            }
        };

        let connected = Arc::new(AtomicBool::new(true));
        let health = Arc::new(HealthChecker::new(
            Arc::new(RedisPing {
                connection: connection.clone(),
            }),
            HealthCheckConfig {
                check_interval: config.health_check_interval,
                check_timeout: config.connection_timeout,
            },
            Arc::clone(&connected),
        ));
        if !config.health_check_interval.is_zero() {
            health.start();
        }

        Ok(Self {
            connection,
            connected,
            health,
            take_tokens_script: Arc::new(Script::new(TAKE_TOKENS_SCRIPT)),
            admit_window_script: Arc::new(Script::new(ADMIT_WINDOW_SCRIPT)),
            url: url.to_string(),
            config,
        })
    }

    /// Ping Redis once and refresh the connected flag
    pub async fn ping(&self) -> bool {
        self.health.check_now().await
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Converts a command result, keeping the connected flag in step with what we observe
    fn track<T>(
        &self,
        operation: &str,
        key: &str,
        started: Instant,
        result: RedisResult<T>,
    ) -> Result<T> {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.connected.store(true, Ordering::SeqCst);
                storage_op!(operation, key, true, elapsed_ms);
                Ok(value)
            }
            Err(e) => {
                if e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                {
                    self.connected.store(false, Ordering::SeqCst);
                }
                storage_op!(operation, key, false, elapsed_ms);
                Err(e.into())
            }
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = conn.get(key).await;
        self.track("get", key, started, result)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = conn.pset_ex(key, value, millis(ttl)).await;
        self.track("set", key, started, result)
    }

    async fn incr(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection.clone();
        let started = Instant::now();

        // MULTI/EXEC so the counter never exists without its expiry
        let result: RedisResult<(i64,)> = redis::pipe()
            .atomic()
            .incr(key, amount)
            .pexpire(key, millis(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await;

        self.track("incr", key, started, result).map(|(count,)| count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = conn.pexpire(key, millis(ttl) as i64).await;
        self.track("expire", key, started, result)
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<i64> = conn.zadd(key, member, score).await;
        self.track("zadd", key, started, result).map(|_| ())
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = conn.zrembyscore(key, min, max).await;
        self.track("zremrangebyscore", key, started, result)
    }

    async fn zcount(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result = conn.zcount(key, min, max).await;
        self.track("zcount", key, started, result)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<i64> = conn.del(key).await;
        self.track("del", key, started, result).map(|removed| removed > 0)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<BucketState>> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<(Option<String>, Option<String>)> = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await;

        match self.track("get_bucket", key, started, result)? {
            (Some(tokens), Some(last_refill)) => {
                let tokens = tokens.parse::<f64>().map_err(|e| {
                    StorageError::Serialization(format!("bad tokens field in '{}': {}", key, e))
                })?;
                let last_refill_ms = last_refill.parse::<u64>().map_err(|e| {
                    StorageError::Serialization(format!("bad last_refill field in '{}': {}", key, e))
                })?;
                Ok(Some(BucketState {
                    tokens,
                    last_refill_ms,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn set_bucket(&self, key: &str, state: BucketState, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<()> = redis::pipe()
            .atomic()
            .hset_multiple(
                key,
                &[
                    ("tokens", state.tokens.to_string()),
                    ("last_refill", state.last_refill_ms.to_string()),
                ],
            )
            .ignore()
            .pexpire(key, millis(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await;

        self.track("set_bucket", key, started, result)
    }

    async fn take_tokens(
        &self,
        key: &str,
        config: &TokenBucketConfig,
        cost: u64,
        now_ms: u64,
    ) -> Result<BucketAdmission> {
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<(i64, String, u64)> = self
            .take_tokens_script
            .key(key)
            .arg(config.capacity)
            .arg(config.refill_rate)
            .arg(config.interval_ms())
            .arg(cost)
            .arg(now_ms)
            .arg(millis(BucketState::ttl(config)))
            .invoke_async(&mut conn)
            .await;

        let (allowed, tokens, last_refill_ms) = self.track("take_tokens", key, started, result)?;
        let tokens = tokens.parse::<f64>().map_err(|e| {
            StorageError::Serialization(format!("bad token count from script: {}", e))
        })?;

        Ok(BucketAdmission {
            allowed: allowed == 1,
            state: BucketState {
                tokens,
                last_refill_ms,
            },
        })
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
        let mut conn = self.connection.clone();
        let started = Instant::now();
        let result: RedisResult<(i64, u64)> = self
            .admit_window_script
            .key(key)
            .arg(now_ms)
            .arg(now_ms.saturating_sub(window_ms))
            .arg(millis(Duration::from_millis(window_ms)))
            .arg(max_requests)
            .arg(cost)
            .arg(member_prefix)
            .invoke_async(&mut conn)
            .await;

        let (allowed, count) = self.track("admit_window", key, started, result)?;
        Ok(WindowAdmission {
            allowed: allowed == 1,
            count,
        })
    }
}
