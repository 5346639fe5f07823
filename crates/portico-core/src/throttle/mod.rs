//! Rate limiting with four interchangeable algorithms.
//!
//! All algorithms share one external contract, [`Throttler::acquire`]: a
//! negative countdown means the unit was admitted and the bucket state has
//! already been advanced; a positive countdown is the time to wait before one
//! unit becomes admissible (the state was not advanced, except for the leaky
//! bucket which enqueues). Admission decisions are linearizable per key
//! because each algorithm is a single named script in the store.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    errors::GatewayError,
    store::{AtomicScript, SharedStore},
    types::{scoped_key, KeyCategory},
};

/// The admission algorithms, selected per policy in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleAlgo {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl ThrottleAlgo {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
            Self::LeakyBucket => "leaky_bucket",
        }
    }
}

/// A fully-specified rate limit: algorithm plus its numeric parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub algo: ThrottleAlgo,
    /// Admissions allowed per window.
    pub quota: u32,
    /// Window length in seconds.
    pub duration_s: u64,
    /// Leaky bucket capacity; ignored by the other algorithms.
    pub bucket_size: u32,
}

impl ThrottlePolicy {
    #[must_use]
    pub fn new(algo: ThrottleAlgo, quota: u32, duration_s: u64) -> Self {
        Self { algo, quota, duration_s, bucket_size: quota }
    }

    #[must_use]
    pub fn with_bucket_size(mut self, bucket_size: u32) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    fn script(&self) -> AtomicScript {
        match self.algo {
            ThrottleAlgo::FixedWindow => {
                AtomicScript::FixedWindow { quota: self.quota, duration_s: self.duration_s }
            }
            ThrottleAlgo::SlidingWindow => {
                AtomicScript::SlidingWindow { quota: self.quota, duration_s: self.duration_s }
            }
            ThrottleAlgo::TokenBucket => {
                AtomicScript::TokenBucket { quota: self.quota, duration_s: self.duration_s }
            }
            ThrottleAlgo::LeakyBucket => AtomicScript::LeakyBucket {
                quota: self.quota,
                duration_s: self.duration_s,
                bucket_size: self.bucket_size,
            },
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The unit was admitted; bucket state is already committed.
    Admitted,
    /// Leaky bucket only: admitted, but the caller should delay this long
    /// before executing to respect the drain rate.
    Delayed(f64),
    /// Rejected; one unit becomes admissible after this many seconds.
    RetryAfter(f64),
}

/// Keyed throttler over a shared store.
///
/// Cloning is cheap; all clones share the same backing store and keyspace.
#[derive(Clone)]
pub struct Throttler {
    store: SharedStore,
    keyspace: String,
}

impl Throttler {
    #[must_use]
    pub fn new(store: SharedStore, keyspace: &str) -> Self {
        Self { store, keyspace: keyspace.to_string() }
    }

    /// Builds the fully-qualified bucket key for a logical throttle key.
    #[must_use]
    pub fn bucket_key(&self, logical_key: &str) -> String {
        scoped_key(&self.keyspace, KeyCategory::Throttle, logical_key)
    }

    /// Attempts to admit one unit under `policy` for `logical_key`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BucketFull`] when a leaky bucket is at
    /// capacity, or a store error if the backing store fails.
    pub async fn acquire(
        &self,
        logical_key: &str,
        policy: &ThrottlePolicy,
    ) -> Result<Admission, GatewayError> {
        let key = self.bucket_key(logical_key);
        let reply = self.store.atomic(&key, policy.script()).await?;

        match reply.into_countdown()? {
            None => Err(GatewayError::BucketFull),
            Some(countdown) if countdown < 0.0 => Ok(Admission::Admitted),
            Some(countdown) => {
                if policy.algo == ThrottleAlgo::LeakyBucket {
                    // The unit is enqueued; the countdown is its drain delay.
                    Ok(Admission::Delayed(countdown))
                } else {
                    tracing::debug!(
                        key = %key,
                        algo = policy.algo.as_str(),
                        retry_after = countdown,
                        "throttle rejected request"
                    );
                    Ok(Admission::RetryAfter(countdown))
                }
            }
        }
    }

    /// Runs `op` under the rate limit, the function-guard form.
    ///
    /// On rejection the call sleeps out the countdown and retries once; a
    /// second rejection fails with [`GatewayError::QuotaExceeded`]. Leaky
    /// bucket delays are slept before invoking `op`.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` after the single retry, `BucketFull` from a saturated
    /// leaky bucket, or whatever `op` itself returns.
    pub async fn run<F, Fut, T>(
        &self,
        logical_key: &str,
        policy: &ThrottlePolicy,
        op: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match self.acquire(logical_key, policy).await? {
            Admission::Admitted => op().await,
            Admission::Delayed(delay) => {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                op().await
            }
            Admission::RetryAfter(wait) => {
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                match self.acquire(logical_key, policy).await? {
                    Admission::Admitted => op().await,
                    Admission::Delayed(delay) => {
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                        op().await
                    }
                    Admission::RetryAfter(retry_after) => {
                        Err(GatewayError::QuotaExceeded { retry_after })
                    }
                }
            }
        }
    }

    /// Removes every bucket in this throttler's keyspace.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn clear(&self) -> Result<u64, GatewayError> {
        let prefix = format!("{}:{}:", self.keyspace, KeyCategory::Throttle.as_str());
        Ok(self.store.clear(&prefix).await?)
    }
}
