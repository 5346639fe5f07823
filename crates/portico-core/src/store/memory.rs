//! In-process store: sharded maps with lazy TTLs and a periodic sweeper.
//!
//! Scripts run inside a single shard critical section, which is what makes
//! them atomic here. The critical section never spans an await point; the
//! lock is `parking_lot::Mutex` and held only for the script body.

use std::{
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::types::CircuitState;

use super::{AtomicScript, Clock, KeyValueStore, ScriptReply, StoreError, StoreResult};

const SHARD_COUNT: usize = 16;

/// Breaker hash fields, shared with the Redis scripts.
const F_STATE: &str = "state";
const F_FAILURES: &str = "failure_count";
const F_OPENED_AT: &str = "opened_at";
const F_PROBING: &str = "probing";

#[derive(Debug, Clone)]
enum Value {
    Raw(Bytes),
    Int(i64),
    Hash(HashMap<String, Bytes>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Epoch seconds after which the entry reads as absent.
    expires_at: Option<f64>,
}

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

type Shard = HashMap<String, Entry, ahash::RandomState>;

/// Sharded in-process [`KeyValueStore`].
///
/// TTLs are enforced lazily on every read and eagerly by
/// [`start_sweeper`](Self::start_sweeper). The clock is injectable so the
/// throttle arithmetic can be driven deterministically in tests.
pub struct InMemoryStore {
    shards: Box<[Mutex<Shard>]>,
    hasher: ahash::RandomState,
    clock: Clock,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Clock::system())
    }

    #[must_use]
    pub fn with_clock(clock: Clock) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect();
        Self { shards, hasher: ahash::RandomState::new(), clock }
    }

    /// Spawns a background task that drops expired entries.
    ///
    /// Lazy expiry already keeps reads correct; the sweeper only bounds the
    /// memory held by keys nobody reads again.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired store entries");
                }
            }
        })
    }

    /// Removes every expired entry, returning the count dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let before = guard.len();
            guard.retain(|_, entry| !entry.is_expired(now));
            removed += before - guard.len();
        }
        removed
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    /// Reads a float hash field, tolerating missing entries.
    fn read_f64(hash: &HashMap<String, Bytes>, field: &str) -> Option<f64> {
        hash.get(field).and_then(|raw| std::str::from_utf8(raw).ok()?.parse().ok())
    }

    fn write_f64(hash: &mut HashMap<String, Bytes>, field: &str, value: f64) {
        hash.insert(field.to_string(), Bytes::from(format!("{value}")));
    }

    /// Fetches the live hash for `key`, resetting expired or mis-typed entries.
    fn live_hash<'a>(shard: &'a mut Shard, key: &str, now: f64) -> Option<&'a mut Entry> {
        let stale = match shard.get(key) {
            Some(entry) => entry.is_expired(now) || !matches!(entry.value, Value::Hash(_)),
            None => return None,
        };
        if stale {
            shard.remove(key);
            return None;
        }
        shard.get_mut(key)
    }

    #[allow(clippy::too_many_lines)]
    fn run_script(&self, key: &str, script: AtomicScript) -> ScriptReply {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();

        match script {
            AtomicScript::FixedWindow { quota, duration_s } => {
                let (window_end, count) = match Self::live_hash(&mut shard, key, now) {
                    Some(entry) => {
                        let Value::Hash(hash) = &entry.value else { unreachable!() };
                        (
                            Self::read_f64(hash, "window_end").unwrap_or(0.0),
                            Self::read_f64(hash, "count").unwrap_or(0.0),
                        )
                    }
                    None => (0.0, 0.0),
                };

                #[allow(clippy::cast_precision_loss)]
                let duration = duration_s as f64;

                if window_end == 0.0 || now > window_end {
                    let mut hash = HashMap::new();
                    Self::write_f64(&mut hash, "window_end", now + duration);
                    Self::write_f64(&mut hash, "count", 1.0);
                    shard.insert(
                        key.to_string(),
                        Entry { value: Value::Hash(hash), expires_at: Some(now + duration) },
                    );
                    return ScriptReply::Countdown(-1.0);
                }

                if count >= f64::from(quota) {
                    return ScriptReply::Countdown(window_end - now);
                }

                if let Some(entry) = Self::live_hash(&mut shard, key, now) {
                    let Value::Hash(hash) = &mut entry.value else { unreachable!() };
                    Self::write_f64(hash, "count", count + 1.0);
                }
                ScriptReply::Countdown(-1.0)
            }

            AtomicScript::SlidingWindow { quota, duration_s } => {
                let (t0, count) = match Self::live_hash(&mut shard, key, now) {
                    Some(entry) => {
                        let Value::Hash(hash) = &entry.value else { unreachable!() };
                        (
                            Self::read_f64(hash, "window_start").unwrap_or(now),
                            Self::read_f64(hash, "count").unwrap_or(0.0),
                        )
                    }
                    None => (now, 0.0),
                };

                #[allow(clippy::cast_precision_loss)]
                let duration = duration_s as f64;
                let quota_f = f64::from(quota);

                let elapsed = now - t0;
                let progress = elapsed % duration;
                let decayed = (elapsed / duration).floor() * quota_f;
                let adjusted = (count - decayed).max(0.0);

                if adjusted >= quota_f {
                    let remains =
                        (duration - progress) + ((adjusted - quota_f + 1.0) / quota_f) * duration;
                    return ScriptReply::Countdown(remains);
                }

                let mut hash = HashMap::new();
                Self::write_f64(&mut hash, "window_start", now - progress);
                Self::write_f64(&mut hash, "count", adjusted + 1.0);
                shard.insert(
                    key.to_string(),
                    Entry { value: Value::Hash(hash), expires_at: Some(now + duration) },
                );
                ScriptReply::Countdown(-1.0)
            }

            AtomicScript::TokenBucket { quota, duration_s } => {
                let quota_f = f64::from(quota);
                let (last, tokens) = match Self::live_hash(&mut shard, key, now) {
                    Some(entry) => {
                        let Value::Hash(hash) = &entry.value else { unreachable!() };
                        (
                            Self::read_f64(hash, "last_refill").unwrap_or(now),
                            Self::read_f64(hash, "tokens").unwrap_or(quota_f),
                        )
                    }
                    None => (now, quota_f),
                };

                #[allow(clippy::cast_precision_loss)]
                let duration = duration_s as f64;
                let refill_rate = quota_f / duration;
                let refilled = quota_f.min(tokens + (now - last) * refill_rate);

                if refilled < 1.0 {
                    return ScriptReply::Countdown((1.0 - refilled) / refill_rate);
                }

                let mut hash = HashMap::new();
                Self::write_f64(&mut hash, "last_refill", now);
                Self::write_f64(&mut hash, "tokens", refilled - 1.0);
                shard.insert(
                    key.to_string(),
                    Entry { value: Value::Hash(hash), expires_at: Some(now + 2.0 * duration) },
                );
                ScriptReply::Countdown(-1.0)
            }

            AtomicScript::LeakyBucket { quota, duration_s, bucket_size } => {
                let (last_leak, level) = match Self::live_hash(&mut shard, key, now) {
                    Some(entry) => {
                        let Value::Hash(hash) = &entry.value else { unreachable!() };
                        (
                            Self::read_f64(hash, "last_leak").unwrap_or(now),
                            Self::read_f64(hash, "level").unwrap_or(0.0),
                        )
                    }
                    None => (now, 0.0),
                };

                #[allow(clippy::cast_precision_loss)]
                let duration = duration_s as f64;
                let leak_rate = f64::from(quota) / duration;
                let drained = (level - (now - last_leak) * leak_rate).max(0.0);

                if drained >= f64::from(bucket_size) {
                    return ScriptReply::BucketFull;
                }

                let mut hash = HashMap::new();
                Self::write_f64(&mut hash, "last_leak", now);
                Self::write_f64(&mut hash, "level", drained + 1.0);
                shard.insert(
                    key.to_string(),
                    Entry { value: Value::Hash(hash), expires_at: Some(now + 2.0 * duration) },
                );

                let delay = drained / leak_rate;
                ScriptReply::Countdown(if delay > 0.0 { delay } else { -1.0 })
            }

            AtomicScript::BreakerTryAcquire { failure_threshold: _, recovery_timeout_s } => {
                let (state, failures, opened_at, probing) = Self::read_breaker(&mut shard, key, now);

                match state {
                    CircuitState::Closed => {
                        ScriptReply::Breaker { allowed: true, state, failure_count: failures }
                    }
                    CircuitState::Open => {
                        if now - opened_at >= recovery_timeout_s {
                            // This caller becomes the probe; `opened_at` now
                            // marks the probe start so an abandoned probe
                            // expires after another recovery window.
                            Self::store_breaker(
                                &mut shard,
                                key,
                                CircuitState::HalfOpen,
                                failures,
                                now,
                                true,
                            );
                            ScriptReply::Breaker {
                                allowed: true,
                                state: CircuitState::HalfOpen,
                                failure_count: failures,
                            }
                        } else {
                            ScriptReply::Breaker { allowed: false, state, failure_count: failures }
                        }
                    }
                    CircuitState::HalfOpen => {
                        if probing && now - opened_at < recovery_timeout_s {
                            ScriptReply::Breaker { allowed: false, state, failure_count: failures }
                        } else {
                            Self::store_breaker(&mut shard, key, state, failures, now, true);
                            ScriptReply::Breaker { allowed: true, state, failure_count: failures }
                        }
                    }
                }
            }

            AtomicScript::BreakerRecord { success, failure_threshold } => {
                let (state, failures, opened_at, _probing) =
                    Self::read_breaker(&mut shard, key, now);

                if success {
                    Self::store_breaker(&mut shard, key, CircuitState::Closed, 0, 0.0, false);
                    return ScriptReply::Breaker {
                        allowed: true,
                        state: CircuitState::Closed,
                        failure_count: 0,
                    };
                }

                let (next_state, next_failures, next_opened) = match state {
                    CircuitState::HalfOpen => (CircuitState::Open, failures, now),
                    _ => {
                        let bumped = failures + 1;
                        if bumped >= failure_threshold {
                            (CircuitState::Open, bumped, now)
                        } else {
                            (state, bumped, opened_at)
                        }
                    }
                };
                Self::store_breaker(&mut shard, key, next_state, next_failures, next_opened, false);
                ScriptReply::Breaker {
                    allowed: false,
                    state: next_state,
                    failure_count: next_failures,
                }
            }

            AtomicScript::LockIfAbsent { ttl_s } => {
                let held = shard.get(key).is_some_and(|entry| !entry.is_expired(now));
                if held {
                    ScriptReply::Acquired(false)
                } else {
                    shard.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Raw(Bytes::from_static(b"1")),
                            expires_at: Some(now + ttl_s),
                        },
                    );
                    ScriptReply::Acquired(true)
                }
            }
        }
    }

    fn read_breaker(shard: &mut Shard, key: &str, now: f64) -> (CircuitState, u32, f64, bool) {
        match Self::live_hash(shard, key, now) {
            Some(entry) => {
                let Value::Hash(hash) = &entry.value else { unreachable!() };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let state =
                    CircuitState::from_u8(Self::read_f64(hash, F_STATE).unwrap_or(0.0) as u8);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let failures = Self::read_f64(hash, F_FAILURES).unwrap_or(0.0) as u32;
                let opened_at = Self::read_f64(hash, F_OPENED_AT).unwrap_or(0.0);
                let probing = Self::read_f64(hash, F_PROBING).unwrap_or(0.0) > 0.0;
                (state, failures, opened_at, probing)
            }
            None => (CircuitState::Closed, 0, 0.0, false),
        }
    }

    fn store_breaker(
        shard: &mut Shard,
        key: &str,
        state: CircuitState,
        failures: u32,
        opened_at: f64,
        probing: bool,
    ) {
        let mut hash = HashMap::new();
        Self::write_f64(&mut hash, F_STATE, f64::from(state.as_u8()));
        Self::write_f64(&mut hash, F_FAILURES, f64::from(failures));
        Self::write_f64(&mut hash, F_OPENED_AT, opened_at);
        Self::write_f64(&mut hash, F_PROBING, if probing { 1.0 } else { 0.0 });
        shard.insert(key.to_string(), Entry { value: Value::Hash(hash), expires_at: None });
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();
        match shard.get(key) {
            Some(entry) if entry.is_expired(now) => {
                shard.remove(key);
                Ok(None)
            }
            Some(entry) => match &entry.value {
                Value::Raw(bytes) => Ok(Some(bytes.clone())),
                Value::Int(n) => Ok(Some(Bytes::from(n.to_string()))),
                Value::Hash(_) => Err(StoreError::Corrupt {
                    key: key.to_string(),
                    reason: "hash read as plain value".to_string(),
                }),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now();
        let expires_at = ttl.map(|d| now + d.as_secs_f64());
        self.shard_for(key)
            .lock()
            .insert(key.to_string(), Entry { value: Value::Raw(value), expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.shard_for(key).lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();
        match shard.get(key) {
            Some(entry) if entry.is_expired(now) => {
                shard.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();

        let created = match shard.get(key) {
            Some(entry) if entry.is_expired(now) => {
                shard.remove(key);
                true
            }
            Some(_) => false,
            None => true,
        };

        if created {
            let expires_at = ttl.map(|d| now + d.as_secs_f64());
            shard.insert(key.to_string(), Entry { value: Value::Int(delta), expires_at });
            return Ok(delta);
        }

        let entry = shard.get_mut(key).expect("checked above");
        match &mut entry.value {
            Value::Int(n) => {
                *n += delta;
                Ok(*n)
            }
            Value::Raw(bytes) => {
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StoreError::Corrupt {
                        key: key.to_string(),
                        reason: "counter value is not an integer".to_string(),
                    })?;
                entry.value = Value::Int(current + delta);
                Ok(current + delta)
            }
            Value::Hash(_) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "counter applied to hash".to_string(),
            }),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();
        match Self::live_hash(&mut shard, key, now) {
            Some(entry) => {
                let Value::Hash(hash) = &entry.value else { unreachable!() };
                Ok(hash.get(field).cloned())
            }
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, fields: &[(&str, Bytes)]) -> StoreResult<()> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();

        if Self::live_hash(&mut shard, key, now).is_none() {
            shard.insert(
                key.to_string(),
                Entry { value: Value::Hash(HashMap::new()), expires_at: None },
            );
        }
        let entry = shard.get_mut(key).expect("inserted above");
        let Value::Hash(hash) = &mut entry.value else { unreachable!() };
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<Bytes>>> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();
        match Self::live_hash(&mut shard, key, now) {
            Some(entry) => {
                let Value::Hash(hash) = &entry.value else { unreachable!() };
                Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect())
            }
            None => Ok(fields.iter().map(|_| None).collect()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut shard = self.shard_for(key).lock();
        match shard.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl.as_secs_f64());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear(&self, prefix: &str) -> StoreResult<u64> {
        let mut removed = 0u64;
        for shard in self.shards.iter() {
            let mut guard = shard.lock();
            let before = guard.len();
            guard.retain(|key, _| !key.starts_with(prefix));
            removed += (before - guard.len()) as u64;
        }
        Ok(removed)
    }

    async fn atomic(&self, key: &str, script: AtomicScript) -> StoreResult<ScriptReply> {
        Ok(self.run_script(key, script))
    }
}
