//! TTL-keyed caching with single-flight population.
//!
//! For a cold key, exactly one producer runs at a time across the whole
//! deployment sharing the store: in-process callers coordinate through a
//! flight registry of watch channels, and processes coordinate through a
//! short-TTL `LockIfAbsent` lock key next to the cache entry. Losers wait for
//! the winner to publish rather than hammering the backend.

use std::{future::Future, time::Duration};

use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    errors::GatewayError,
    store::{AtomicScript, ScriptReply, SharedStore},
    types::{scoped_key, GatewayResponse, KeyCategory},
};

/// How long a single-flight lock may be held before waiters assume the
/// winner died and re-compete.
const FLIGHT_LOCK_TTL: Duration = Duration::from_secs(10);

/// Poll backoff bounds for cross-process waiters.
const POLL_INITIAL: Duration = Duration::from_millis(20);
const POLL_MAX: Duration = Duration::from_millis(200);

/// A cached HTTP response, immutable once written until TTL expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_encoding")]
    pub body: Bytes,
    /// Epoch seconds; `None` means the entry never expires on its own.
    pub expires_at: Option<f64>,
}

mod body_encoding {
    //! Bodies are arbitrary bytes; base64 keeps the serialized entry valid JSON.

    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

impl CacheEntry {
    /// Captures a gateway response for storage.
    #[must_use]
    pub fn from_response(response: &GatewayResponse, expires_at: Option<f64>) -> Self {
        let content_type = response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status: response.status.as_u16(),
            content_type,
            headers,
            body: response.body.clone(),
            expires_at,
        }
    }

    /// Reconstructs the response this entry was captured from.
    #[must_use]
    pub fn into_response(self) -> GatewayResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::try_from(name.as_str()),
                http::HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        GatewayResponse {
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: self.body,
        }
    }
}

/// Outcome published to in-process flight waiters.
///
/// Producer errors carry only their display form; the winner sees the
/// original error, concurrent waiters get it re-wrapped.
type FlightOutcome = Option<Result<Bytes, String>>;

/// Single-flight cache over the shared store.
pub struct ResponseCache {
    store: SharedStore,
    keyspace: String,
    flights: DashMap<String, watch::Receiver<FlightOutcome>>,
}

impl ResponseCache {
    #[must_use]
    pub fn new(store: SharedStore, keyspace: &str) -> Self {
        Self { store, keyspace: keyspace.to_string(), flights: DashMap::new() }
    }

    fn cache_key(&self, digest: &str) -> String {
        scoped_key(&self.keyspace, KeyCategory::Cache, digest)
    }

    /// Looks up a stored entry without populating on miss.
    ///
    /// # Errors
    ///
    /// Propagates store failures; a corrupt stored entry reads as a miss and
    /// is deleted.
    pub async fn lookup(&self, digest: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let key = self.cache_key(digest);
        match self.store.get(&key).await? {
            Some(raw) => match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) => Ok(Some(entry)),
                Err(error) => {
                    tracing::warn!(key = %key, %error, "dropping undecodable cache entry");
                    self.store.delete(&key).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Stores an entry under `digest` with the given TTL.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn insert(
        &self,
        digest: &str,
        entry: &CacheEntry,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let key = self.cache_key(digest);
        let raw = serde_json::to_vec(entry)
            .map_err(|e| GatewayError::Internal(format!("cache entry serialization: {e}")))?;
        self.store.set(&key, Bytes::from(raw), Some(ttl)).await?;
        Ok(())
    }

    /// Returns the cached entry for `digest`, running `producer` exactly once
    /// across the deployment when the key is cold.
    ///
    /// # Errors
    ///
    /// The winner's producer error propagates unchanged; concurrent waiters
    /// observe it as [`GatewayError::Internal`] carrying the display form.
    pub async fn get_or_compute<F, Fut>(
        &self,
        digest: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<CacheEntry, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CacheEntry, GatewayError>>,
    {
        let raw = self
            .get_or_compute_bytes(digest, ttl, || async {
                let entry = producer().await?;
                serde_json::to_vec(&entry).map(|raw| (Bytes::from(raw), true)).map_err(|e| {
                    GatewayError::Internal(format!("cache entry serialization: {e}"))
                })
            })
            .await?;

        serde_json::from_slice(&raw).map_err(|e| {
            GatewayError::Internal(format!("cache entry deserialization: {e}"))
        })
    }

    /// Pipeline variant of [`get_or_compute`](Self::get_or_compute): the
    /// producer yields a live response, and only cacheable statuses are
    /// stored. Waiters still receive uncacheable responses; they just are
    /// not persisted.
    ///
    /// # Errors
    ///
    /// As [`get_or_compute`](Self::get_or_compute).
    pub async fn get_or_produce_response<F, Fut>(
        &self,
        digest: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<GatewayResponse, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
    {
        #[allow(clippy::cast_precision_loss)]
        let expires_at = chrono::Utc::now().timestamp() as f64 + ttl.as_secs_f64();
        let raw = self
            .get_or_compute_bytes(digest, ttl, || async move {
                let response = producer().await?;
                let cacheable = response.is_cacheable();
                let entry = CacheEntry::from_response(&response, Some(expires_at));
                serde_json::to_vec(&entry).map(|raw| (Bytes::from(raw), cacheable)).map_err(
                    |e| GatewayError::Internal(format!("cache entry serialization: {e}")),
                )
            })
            .await?;

        let entry: CacheEntry = serde_json::from_slice(&raw).map_err(|e| {
            GatewayError::Internal(format!("cache entry deserialization: {e}"))
        })?;
        Ok(entry.into_response())
    }

    /// Generic memoization for arbitrary serializable results.
    ///
    /// This is the decorator form: the caller supplies the logical key
    /// (typically derived from function identity plus an argument
    /// fingerprint) and gets single-flight population for free.
    ///
    /// # Errors
    ///
    /// As [`get_or_compute`](Self::get_or_compute).
    pub async fn memoize<T, F, Fut>(
        &self,
        logical_key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let raw = self
            .get_or_compute_bytes(logical_key, ttl, || async {
                let value = producer().await?;
                serde_json::to_vec(&value)
                    .map(|raw| (Bytes::from(raw), true))
                    .map_err(|e| GatewayError::Internal(format!("memoized value: {e}")))
            })
            .await?;

        serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::Internal(format!("memoized value decode: {e}")))
    }

    /// Removes all entries under this cache's keyspace, or a sub-prefix.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear(&self, prefix: Option<&str>) -> Result<u64, GatewayError> {
        let base = format!("{}:{}:", self.keyspace, KeyCategory::Cache.as_str());
        let full = match prefix {
            Some(p) => format!("{base}{p}"),
            None => base,
        };
        Ok(self.store.clear(&full).await?)
    }

    /// Shared single-flight core. The producer returns the serialized value
    /// plus whether it should be persisted; either way the value is
    /// published to waiters.
    async fn get_or_compute_bytes<F, Fut>(
        &self,
        digest: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<Bytes, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Bytes, bool), GatewayError>>,
    {
        let key = self.cache_key(digest);
        // The winner path always returns, so the producer runs at most once
        // even though the compete loop may iterate.
        let mut producer = Some(producer);

        loop {
            if let Some(raw) = self.store.get(&key).await? {
                return Ok(raw);
            }

            // In-process coordination: join an existing flight if one is
            // active, otherwise become the winner.
            let (tx, rx) = watch::channel::<FlightOutcome>(None);
            match self.flights.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    let mut waiter = occupied.get().clone();
                    drop(occupied);
                    match Self::await_flight(&mut waiter).await {
                        FlightWait::Published(Ok(raw)) => return Ok(raw),
                        FlightWait::Published(Err(message)) => {
                            return Err(GatewayError::Internal(format!(
                                "cache producer failed: {message}"
                            )))
                        }
                        // The winner was cancelled before publishing (e.g.
                        // its deadline fired); re-compete for the flight.
                        FlightWait::Aborted => continue,
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(rx);
                }
            }

            // Deregister on every exit, including cancellation mid-produce;
            // otherwise a dropped winner would wedge the key for good.
            let guard = FlightGuard { flights: &self.flights, key: key.clone() };
            let result = self.lead_flight(&key, ttl, &mut producer).await;

            // Publish before deregistering so joined waiters always observe
            // the outcome.
            let outcome = match &result {
                Ok(raw) => Some(Ok(raw.clone())),
                Err(error) => Some(Err(error.to_string())),
            };
            let _ = tx.send(outcome);
            drop(guard);

            return result;
        }
    }

    /// The winner path: take the cross-process lock, produce, publish.
    async fn lead_flight<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: &mut Option<F>,
    ) -> Result<Bytes, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Bytes, bool), GatewayError>>,
    {
        let lock_key = format!("{key}:sf");
        let mut backoff = POLL_INITIAL;
        let deadline = tokio::time::Instant::now() + FLIGHT_LOCK_TTL * 2;

        loop {
            // Another process may have published while we were waiting.
            if let Some(raw) = self.store.get(key).await? {
                return Ok(raw);
            }

            let acquired = matches!(
                self.store
                    .atomic(
                        &lock_key,
                        AtomicScript::LockIfAbsent { ttl_s: FLIGHT_LOCK_TTL.as_secs_f64() },
                    )
                    .await?,
                ScriptReply::Acquired(true)
            );

            if acquired {
                let produce = producer.take().ok_or_else(|| {
                    GatewayError::Internal("single-flight producer consumed twice".to_string())
                })?;
                let result = produce().await;
                match result {
                    Ok((raw, persist)) => {
                        if persist {
                            self.store.set(key, raw.clone(), Some(ttl)).await?;
                        }
                        self.store.delete(&lock_key).await?;
                        return Ok(raw);
                    }
                    Err(error) => {
                        self.store.delete(&lock_key).await?;
                        return Err(error);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Internal(format!(
                    "timed out waiting for single-flight lock on {key}"
                )));
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }

    async fn await_flight(waiter: &mut watch::Receiver<FlightOutcome>) -> FlightWait {
        loop {
            if let Some(outcome) = waiter.borrow().clone() {
                return FlightWait::Published(outcome);
            }
            if waiter.changed().await.is_err() {
                return FlightWait::Aborted;
            }
        }
    }
}

/// How a joined flight ended for a waiter.
enum FlightWait {
    /// The winner published a result (value or producer error).
    Published(Result<Bytes, String>),
    /// The winner was dropped before publishing; the key is up for grabs.
    Aborted,
}

/// Removes the flight registry entry when the winner exits, normally or by
/// cancellation.
struct FlightGuard<'a> {
    flights: &'a DashMap<String, watch::Receiver<FlightOutcome>>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

/// Builds the decorator-form cache key from function identity and arguments.
///
/// Mirrors the key layout of the response path: the caller's module/function
/// name plus a stable argument fingerprint.
#[must_use]
pub fn memo_key(function: &str, args_fingerprint: &str) -> String {
    if args_fingerprint.is_empty() {
        function.to_string()
    } else {
        format!("{function}:{args_fingerprint}")
    }
}

/// Stable fingerprint for argument tuples that serialize to JSON.
#[must_use]
pub fn args_fingerprint<T: Serialize>(args: &T) -> String {
    let serialized = serde_json::to_vec(args).unwrap_or_default();
    let digest = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&serialized);
    // Bounded so keys stay readable in the store.
    digest.chars().take(48).collect()
}
