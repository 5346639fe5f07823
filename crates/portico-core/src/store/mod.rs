//! Key/value storage abstraction shared by every stateful feature.
//!
//! All cross-request mutable state (throttle buckets, cached responses,
//! circuit breaker machines) flows through [`KeyValueStore`]. The contract is
//! deliberately small: plain byte values with optional TTLs, hash fields,
//! counters, and **named atomic scripts**. A script executes against exactly
//! one key and is linearizable across every caller sharing the backing store,
//! which is what lets the throttle algorithms avoid caller-side
//! read-modify-write races.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::InMemoryStore`] — sharded mutex-protected maps with lazy TTL
//!   enforcement and a periodic sweeper. Scripts run inside one shard lock.
//! - [`redis::RedisStore`] — a shared Redis database; scripts are server-side
//!   Lua so the same linearizability holds across processes.

pub mod memory;
pub mod redis;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::CircuitState;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

/// Errors from the storage layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A named script failed to execute.
    #[error("atomic script failed: {0}")]
    Script(String),

    /// A stored value could not be decoded into its expected shape.
    #[error("corrupt value for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Named atomic scripts the store executes against a single key.
///
/// The algorithm semantics live here as data; each backend supplies the
/// execution (a shard critical section in-process, Lua on Redis). Adding an
/// algorithm means adding a variant and teaching both backends about it,
/// which the exhaustive matches enforce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtomicScript {
    /// Fixed-window admission: reset on expiry, count up to `quota`.
    FixedWindow { quota: u32, duration_s: u64 },
    /// Sliding-window admission with proportional decay of the carried count.
    SlidingWindow { quota: u32, duration_s: u64 },
    /// Token bucket: refill at `quota/duration`, spend one token per unit.
    TokenBucket { quota: u32, duration_s: u64 },
    /// Leaky bucket: drain at `quota/duration`, reject above `bucket_size`.
    LeakyBucket { quota: u32, duration_s: u64, bucket_size: u32 },
    /// Circuit breaker admission check, including the single-probe rule.
    BreakerTryAcquire { failure_threshold: u32, recovery_timeout_s: f64 },
    /// Circuit breaker outcome recording.
    BreakerRecord { success: bool, failure_threshold: u32 },
    /// Set-if-absent with TTL, used as the cache single-flight lock.
    LockIfAbsent { ttl_s: f64 },
}

/// Result of an [`AtomicScript`] execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptReply {
    /// Throttle verdict: `-1.0` means admitted (state already advanced),
    /// a positive value is the seconds to wait before retrying.
    Countdown(f64),
    /// A leaky bucket is at capacity; nothing was enqueued.
    BucketFull,
    /// Circuit breaker verdict after an acquire or record operation.
    Breaker { allowed: bool, state: CircuitState, failure_count: u32 },
    /// Whether a `LockIfAbsent` call obtained the lock.
    Acquired(bool),
}

impl ScriptReply {
    /// Unwraps a throttle countdown, treating any other reply as a defect.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Script`] if the reply is not a countdown or
    /// bucket-full verdict.
    pub fn into_countdown(self) -> StoreResult<Option<f64>> {
        match self {
            Self::Countdown(v) => Ok(Some(v)),
            Self::BucketFull => Ok(None),
            other => Err(StoreError::Script(format!("expected countdown, got {other:?}"))),
        }
    }
}

/// Abstract key/value store with TTLs, counters, hash fields and scripts.
///
/// All operations are async and total: missing keys read as `None`/defaults
/// rather than erroring. Implementations must make each [`atomic`] call
/// linearizable with respect to every other operation on the same key.
///
/// [`atomic`]: KeyValueStore::atomic
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a plain value.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Overwrites a plain value, optionally with a TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> StoreResult<()>;

    /// Removes a key of any shape. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Returns `true` if the key exists and has not expired.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Atomically adds `delta` to an integer key, creating it at zero.
    ///
    /// When `ttl` is set and the key was created by this call, the TTL is
    /// applied; an existing key keeps its expiry.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64>;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>>;

    /// Writes multiple hash fields in one call.
    async fn hset(&self, key: &str, fields: &[(&str, Bytes)]) -> StoreResult<()>;

    /// Reads multiple hash fields; each position is `None` when absent.
    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<Bytes>>>;

    /// Sets or refreshes a key's TTL. Returns `false` if the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes every key starting with `prefix`, returning the count removed.
    async fn clear(&self, prefix: &str) -> StoreResult<u64>;

    /// Executes a named script atomically against one key.
    async fn atomic(&self, key: &str, script: AtomicScript) -> StoreResult<ScriptReply>;
}

/// Shared handle type the rest of the crate passes around.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Clock used by the in-process store, injectable so tests control time.
///
/// The remote store ignores this and uses the Redis server clock, which keeps
/// bucket arithmetic consistent across gateway instances.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> f64 + Send + Sync>);

impl Clock {
    /// Wall-clock seconds since the Unix epoch.
    #[must_use]
    pub fn system() -> Self {
        Self(Arc::new(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        }))
    }

    /// A clock that reads from an external cell, for deterministic tests.
    #[must_use]
    pub fn manual() -> (Self, ManualClock) {
        let cell = Arc::new(parking_lot::Mutex::new(0.0_f64));
        let reader = Arc::clone(&cell);
        (Self(Arc::new(move || *reader.lock())), ManualClock(cell))
    }

    /// Current time in epoch seconds.
    #[must_use]
    pub fn now(&self) -> f64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

/// Writer half of [`Clock::manual`].
#[derive(Clone)]
pub struct ManualClock(Arc<parking_lot::Mutex<f64>>);

impl ManualClock {
    pub fn set(&self, epoch_seconds: f64) {
        *self.0.lock() = epoch_seconds;
    }

    pub fn advance(&self, seconds: f64) {
        *self.0.lock() += seconds;
    }
}
