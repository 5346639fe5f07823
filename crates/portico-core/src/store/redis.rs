//! Redis-backed shared store.
//!
//! Every named script runs server-side as Lua, using the Redis server clock
//! (`TIME`) so bucket arithmetic stays consistent across gateway instances
//! sharing the database. Scripts are registered through [`redis::Script`],
//! which handles `EVALSHA` caching and the `EVAL` fallback transparently.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{aio::MultiplexedConnection, AsyncCommands, Script};

use super::{AtomicScript, KeyValueStore, ScriptReply, StoreError, StoreResult};
use crate::types::CircuitState;

/// Shared Lua prelude: effects replication plus a float `now` in epoch seconds.
const PRELUDE: &str = r"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
";

const FIXED_WINDOW: &str = r"
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local window_end = tonumber(redis.call('HGET', KEYS[1], 'window_end'))
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
if not window_end or now > window_end then
  redis.call('HSET', KEYS[1], 'window_end', now + duration, 'count', 1)
  redis.call('PEXPIRE', KEYS[1], math.floor(duration * 1000))
  return '-1'
end
if count >= quota then
  return tostring(window_end - now)
end
redis.call('HINCRBY', KEYS[1], 'count', 1)
return '-1'
";

const SLIDING_WINDOW: &str = r"
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local t0 = tonumber(redis.call('HGET', KEYS[1], 'window_start')) or now
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
local elapsed = now - t0
local progress = elapsed % duration
local decayed = math.floor(elapsed / duration) * quota
local adjusted = math.max(0, count - decayed)
if adjusted >= quota then
  return tostring((duration - progress) + ((adjusted - quota + 1) / quota) * duration)
end
redis.call('HSET', KEYS[1], 'window_start', now - progress, 'count', adjusted + 1)
redis.call('PEXPIRE', KEYS[1], math.floor(duration * 1000))
return '-1'
";

const TOKEN_BUCKET: &str = r"
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local last = tonumber(redis.call('HGET', KEYS[1], 'last_refill')) or now
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens')) or quota
local rate = quota / duration
local refilled = math.min(quota, tokens + (now - last) * rate)
if refilled < 1 then
  return tostring((1 - refilled) / rate)
end
redis.call('HSET', KEYS[1], 'last_refill', now, 'tokens', refilled - 1)
redis.call('PEXPIRE', KEYS[1], math.floor(duration * 2000))
return '-1'
";

const LEAKY_BUCKET: &str = r"
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local bucket_size = tonumber(ARGV[3])
local last_leak = tonumber(redis.call('HGET', KEYS[1], 'last_leak')) or now
local level = tonumber(redis.call('HGET', KEYS[1], 'level')) or 0
local rate = quota / duration
local drained = math.max(0, level - (now - last_leak) * rate)
if drained >= bucket_size then
  return 'full'
end
redis.call('HSET', KEYS[1], 'last_leak', now, 'level', drained + 1)
redis.call('PEXPIRE', KEYS[1], math.floor(duration * 2000))
local delay = drained / rate
if delay > 0 then
  return tostring(delay)
end
return '-1'
";

const BREAKER_TRY_ACQUIRE: &str = r"
local recovery = tonumber(ARGV[1])
local state = tonumber(redis.call('HGET', KEYS[1], 'state')) or 0
local failures = tonumber(redis.call('HGET', KEYS[1], 'failure_count')) or 0
local opened_at = tonumber(redis.call('HGET', KEYS[1], 'opened_at')) or 0
local probing = tonumber(redis.call('HGET', KEYS[1], 'probing')) or 0
if state == 0 then
  return {'1', '0', tostring(failures)}
end
if state == 1 then
  if now - opened_at >= recovery then
    redis.call('HSET', KEYS[1], 'state', 2, 'probing', 1, 'opened_at', now)
    return {'1', '2', tostring(failures)}
  end
  return {'0', '1', tostring(failures)}
end
if probing == 0 or now - opened_at >= recovery then
  redis.call('HSET', KEYS[1], 'probing', 1, 'opened_at', now)
  return {'1', '2', tostring(failures)}
end
return {'0', '2', tostring(failures)}
";

const BREAKER_RECORD: &str = r"
local success = tonumber(ARGV[1])
local threshold = tonumber(ARGV[2])
local state = tonumber(redis.call('HGET', KEYS[1], 'state')) or 0
local failures = tonumber(redis.call('HGET', KEYS[1], 'failure_count')) or 0
if success == 1 then
  redis.call('HSET', KEYS[1], 'state', 0, 'failure_count', 0, 'opened_at', 0, 'probing', 0)
  return {'1', '0', '0'}
end
if state == 2 then
  redis.call('HSET', KEYS[1], 'state', 1, 'opened_at', now, 'probing', 0)
  return {'0', '1', tostring(failures)}
end
failures = failures + 1
if failures >= threshold then
  redis.call('HSET', KEYS[1], 'state', 1, 'failure_count', failures, 'opened_at', now, 'probing', 0)
  return {'0', '1', tostring(failures)}
end
redis.call('HSET', KEYS[1], 'failure_count', failures)
return {'0', tostring(state), tostring(failures)}
";

struct Scripts {
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    leaky_bucket: Script,
    breaker_try_acquire: Script,
    breaker_record: Script,
}

impl Scripts {
    fn new() -> Self {
        let assemble = |body: &str| Script::new(&format!("{PRELUDE}{body}"));
        Self {
            fixed_window: assemble(FIXED_WINDOW),
            sliding_window: assemble(SLIDING_WINDOW),
            token_bucket: assemble(TOKEN_BUCKET),
            leaky_bucket: assemble(LEAKY_BUCKET),
            breaker_try_acquire: assemble(BREAKER_TRY_ACQUIRE),
            breaker_record: assemble(BREAKER_RECORD),
        }
    }
}

/// [`KeyValueStore`] backed by a shared Redis database.
pub struct RedisStore {
    connection: MultiplexedConnection,
    scripts: Scripts,
}

impl RedisStore {
    /// Connects to the given Redis URL (e.g. `redis://127.0.0.1:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the URL is invalid or the server
    /// is unreachable.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(from_redis)?;
        let connection =
            client.get_multiplexed_async_connection().await.map_err(from_redis)?;
        tracing::info!(url, "connected to redis store");
        Ok(Self { connection, scripts: Scripts::new() })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    fn parse_countdown(raw: &str) -> StoreResult<ScriptReply> {
        if raw == "full" {
            return Ok(ScriptReply::BucketFull);
        }
        raw.parse::<f64>().map(ScriptReply::Countdown).map_err(|_| {
            StoreError::Script(format!("unparseable countdown reply: {raw}"))
        })
    }

    fn parse_breaker(raw: &[String]) -> StoreResult<ScriptReply> {
        if raw.len() != 3 {
            return Err(StoreError::Script(format!("breaker reply had {} fields", raw.len())));
        }
        let allowed = raw[0] == "1";
        let state = CircuitState::from_u8(raw[1].parse().unwrap_or(0));
        let failure_count = raw[2].parse().unwrap_or(0);
        Ok(ScriptReply::Breaker { allowed, state, failure_count })
    }
}

fn from_redis(error: redis::RedisError) -> StoreError {
    StoreError::Connection(error.to_string())
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = self.conn().get(key).await.map_err(from_redis)?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .pset_ex::<_, _, ()>(key, value.as_ref(), ttl.as_millis().try_into().unwrap_or(u64::MAX))
                .await
                .map_err(from_redis),
            None => conn.set::<_, _, ()>(key, value.as_ref()).await.map_err(from_redis),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.conn().del::<_, ()>(key).await.map_err(from_redis)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.conn().exists(key).await.map_err(from_redis)
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = conn.incr(key, delta).await.map_err(from_redis)?;
        // Fresh key: the counter equals the delta exactly once.
        if value == delta {
            if let Some(ttl) = ttl {
                let _: bool = conn
                    .pexpire(key, ttl.as_millis().try_into().unwrap_or(i64::MAX))
                    .await
                    .map_err(from_redis)?;
            }
        }
        Ok(value)
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        let value: Option<Vec<u8>> = self.conn().hget(key, field).await.map_err(from_redis)?;
        Ok(value.map(Bytes::from))
    }

    async fn hset(&self, key: &str, fields: &[(&str, Bytes)]) -> StoreResult<()> {
        let pairs: Vec<(&str, &[u8])> =
            fields.iter().map(|(field, value)| (*field, value.as_ref())).collect();
        self.conn().hset_multiple::<_, _, _, ()>(key, &pairs).await.map_err(from_redis)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<Bytes>>> {
        let values: Vec<Option<Vec<u8>>> =
            self.conn().hget(key, fields).await.map_err(from_redis)?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.conn()
            .pexpire(key, ttl.as_millis().try_into().unwrap_or(i64::MAX))
            .await
            .map_err(from_redis)
    }

    async fn clear(&self, prefix: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(from_redis)?;
            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(from_redis)?;
                removed += deleted;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn atomic(&self, key: &str, script: AtomicScript) -> StoreResult<ScriptReply> {
        let mut conn = self.conn();
        match script {
            AtomicScript::FixedWindow { quota, duration_s } => {
                let raw: String = self
                    .scripts
                    .fixed_window
                    .key(key)
                    .arg(quota)
                    .arg(duration_s)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_countdown(&raw)
            }
            AtomicScript::SlidingWindow { quota, duration_s } => {
                let raw: String = self
                    .scripts
                    .sliding_window
                    .key(key)
                    .arg(quota)
                    .arg(duration_s)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_countdown(&raw)
            }
            AtomicScript::TokenBucket { quota, duration_s } => {
                let raw: String = self
                    .scripts
                    .token_bucket
                    .key(key)
                    .arg(quota)
                    .arg(duration_s)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_countdown(&raw)
            }
            AtomicScript::LeakyBucket { quota, duration_s, bucket_size } => {
                let raw: String = self
                    .scripts
                    .leaky_bucket
                    .key(key)
                    .arg(quota)
                    .arg(duration_s)
                    .arg(bucket_size)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_countdown(&raw)
            }
            AtomicScript::BreakerTryAcquire { failure_threshold: _, recovery_timeout_s } => {
                let raw: Vec<String> = self
                    .scripts
                    .breaker_try_acquire
                    .key(key)
                    .arg(recovery_timeout_s)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_breaker(&raw)
            }
            AtomicScript::BreakerRecord { success, failure_threshold } => {
                let raw: Vec<String> = self
                    .scripts
                    .breaker_record
                    .key(key)
                    .arg(u8::from(success))
                    .arg(failure_threshold)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Self::parse_breaker(&raw)
            }
            AtomicScript::LockIfAbsent { ttl_s } => {
                // SET NX PX is already atomic server-side, no Lua needed.
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let ttl_ms = (ttl_s * 1000.0).max(1.0) as u64;
                let acquired: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg("1")
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(from_redis)?;
                Ok(ScriptReply::Acquired(acquired.is_some()))
            }
        }
    }
}
