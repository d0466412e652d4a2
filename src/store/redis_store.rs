//! Redis-backed counter store.
//!
//! Each rate limit step is a single server-evaluated Lua script, so the trim,
//! count and insert (or refill and consume) happen in one atomic operation on
//! the Redis server no matter how many processes share the key.
//!
//! The connection is established lazily. A store opened while Redis is down
//! keeps retrying on every call, with the whole round trip (connect included)
//! bounded by the configured timeout.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, Script, ScriptInvocation};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BucketOutcome, CounterStore, WindowOutcome};
use crate::error::{QuotaGateError, Result};

/// Trim, count and conditionally insert into a sorted set of timestamps.
///
/// Returns `{allowed, count_before, oldest_score, newest_score}` with `-1`
/// standing in for a missing score.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
    redis.call('ZADD', key, now, member)
    allowed = 1
end
redis.call('PEXPIRE', key, window)

local oldest = -1
local newest = -1
local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if first[2] then
    oldest = tonumber(first[2])
end
local last = redis.call('ZRANGE', key, -1, -1, 'WITHSCORES')
if last[2] then
    newest = tonumber(last[2])
end

return {allowed, count, oldest, newest}
"#;

/// Refill and conditionally drain a `(tokens, ts)` hash.
///
/// Returns `{allowed, tokens_before}`; the token count is a string because Lua
/// numbers are truncated to integers on the way out.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * capacity / window)
local before = tokens

local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(math.max(ts, now)))
redis.call('PEXPIRE', key, window)

return {allowed, tostring(before)}
"#;

/// Redis-backed counter store shared by every process pointing at the same
/// Redis instance.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
    timeout: Duration,
    sliding_window: Script,
    token_bucket: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url` without connecting.
    ///
    /// # Errors
    /// Returns a configuration error if the URL cannot be parsed.
    pub fn open(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            QuotaGateError::Config(format!("Invalid store address {:?}: {}", url, e))
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    /// Create a store for `url` and verify Redis answers.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let store = Self::open(url, timeout)?;
        store.ping().await?;
        Ok(store)
    }

    /// Get the shared connection, establishing it on first use.
    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone()).await?;
        info!("Connected to Redis counter store");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Run a script with the whole round trip bounded by the store timeout.
    async fn invoke<T>(&self, invocation: ScriptInvocation<'_>) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        let round_trip = async {
            let mut conn = self.connection().await?;
            let value: T = invocation.invoke_async(&mut conn).await?;
            Ok::<T, QuotaGateError>(value)
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(QuotaGateError::StoreUnavailable(format!(
                "Redis did not answer within {:?}",
                self.timeout
            ))),
        }
    }
}

/// Map the `-1` sentinel used by the script to `None`.
fn score(value: i64) -> Option<u64> {
    u64::try_from(value).ok()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowOutcome> {
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let mut invocation = self.sliding_window.prepare_invoke();
        invocation
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(now_ms)
            .arg(member);

        let (allowed, count, oldest, newest): (i64, i64, i64, i64) =
            self.invoke(invocation).await?;

        debug!(key = %key, allowed = allowed, count = count, "Sliding window step");

        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest_ms: score(oldest),
            newest_ms: score(newest),
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<BucketOutcome> {
        let mut invocation = self.token_bucket.prepare_invoke();
        invocation.key(key).arg(capacity).arg(window_ms).arg(now_ms);

        let (allowed, tokens): (i64, String) = self.invoke(invocation).await?;
        let tokens: f64 = tokens.parse().map_err(|_| {
            QuotaGateError::StoreUnavailable(format!(
                "Redis returned a malformed token count: {:?}",
                tokens
            ))
        })?;

        debug!(key = %key, allowed = allowed, tokens = tokens, "Token bucket step");

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn ping(&self) -> Result<()> {
        let round_trip = async {
            let mut conn = self.connection().await?;
            let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), QuotaGateError>(())
        };

        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(QuotaGateError::StoreUnavailable(format!(
                "Redis did not answer PING within {:?}",
                self.timeout
            ))),
        }
    }

    async fn close(&self) {
        if self.connection.lock().await.take().is_some() {
            info!("Closed Redis counter store connection");
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
