//! Per-key circuit breaker backed by the shared store.
//!
//! The state machine lives in a store hash (`{ks}:cb:{key}`), so every
//! gateway instance sharing the store observes the same circuit. Transitions
//! and the at-most-one-probe rule for `HalfOpen` execute as atomic scripts;
//! there is no caller-side read-modify-write.

use serde::{Deserialize, Serialize};

use crate::{
    errors::GatewayError,
    store::{AtomicScript, ScriptReply, SharedStore},
    types::{scoped_key, CircuitState, KeyCategory},
};

/// Breaker thresholds, usually taken from the matched policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds to hold the circuit open before probing.
    pub recovery_timeout_s: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout_s: 60.0 }
    }
}

/// What the breaker decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerVerdict {
    pub allowed: bool,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Keyed circuit breaker. Clones share the backing store.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: SharedStore,
    keyspace: String,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(store: SharedStore, keyspace: &str) -> Self {
        Self { store, keyspace: keyspace.to_string() }
    }

    fn breaker_key(&self, logical_key: &str) -> String {
        scoped_key(&self.keyspace, KeyCategory::CircuitBreaker, logical_key)
    }

    /// Asks whether a request may proceed.
    ///
    /// An `Open` circuit whose recovery timeout has elapsed transitions to
    /// `HalfOpen` and admits exactly this caller as the probe; concurrent
    /// callers are blocked until the probe reports back.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn try_acquire(
        &self,
        logical_key: &str,
        config: &BreakerConfig,
    ) -> Result<BreakerVerdict, GatewayError> {
        let key = self.breaker_key(logical_key);
        let reply = self
            .store
            .atomic(
                &key,
                AtomicScript::BreakerTryAcquire {
                    failure_threshold: config.failure_threshold,
                    recovery_timeout_s: config.recovery_timeout_s,
                },
            )
            .await?;

        match reply {
            ScriptReply::Breaker { allowed, state, failure_count } => {
                if !allowed {
                    tracing::debug!(key = %key, state = state.as_str(), "circuit blocked request");
                }
                Ok(BreakerVerdict { allowed, state, failure_count })
            }
            other => Err(GatewayError::Internal(format!(
                "breaker acquire returned unexpected reply {other:?}"
            ))),
        }
    }

    /// Records the outcome of an admitted request.
    ///
    /// Success closes the circuit and resets the failure counter; failure
    /// increments it, opening the circuit at the threshold. A failed probe
    /// re-opens immediately and restarts the recovery timer.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn record(
        &self,
        logical_key: &str,
        config: &BreakerConfig,
        success: bool,
    ) -> Result<CircuitState, GatewayError> {
        let key = self.breaker_key(logical_key);
        let reply = self
            .store
            .atomic(
                &key,
                AtomicScript::BreakerRecord {
                    success,
                    failure_threshold: config.failure_threshold,
                },
            )
            .await?;

        match reply {
            ScriptReply::Breaker { state, failure_count, .. } => {
                if state == CircuitState::Open && !success {
                    tracing::warn!(
                        key = %key,
                        failure_count,
                        threshold = config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
                Ok(state)
            }
            other => Err(GatewayError::Internal(format!(
                "breaker record returned unexpected reply {other:?}"
            ))),
        }
    }

    /// Current state without side effects, for telemetry.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn state(&self, logical_key: &str) -> Result<CircuitState, GatewayError> {
        let key = self.breaker_key(logical_key);
        let raw = self.store.hget(&key, "state").await?;
        let state = raw
            .and_then(|bytes| std::str::from_utf8(&bytes).ok().map(str::to_owned))
            .and_then(|s| s.parse::<f64>().ok())
            .map_or(CircuitState::Closed, |n| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                CircuitState::from_u8(n as u8)
            });
        Ok(state)
    }

    /// Forces the circuit for `logical_key` back to `Closed`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn reset(&self, logical_key: &str, config: &BreakerConfig) -> Result<(), GatewayError> {
        self.record(logical_key, config, true).await?;
        Ok(())
    }
}
