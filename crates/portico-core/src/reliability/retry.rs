//! Attempt loops with configurable wait schedules.

use std::{sync::Arc, time::Duration};

use crate::errors::GatewayError;

/// How long to sleep between attempts.
///
/// The sequence form reuses its last value once attempts outrun it, so a
/// schedule of `[0.1, 0.5]` means 0.1s, then 0.5s forever after.
#[derive(Clone)]
pub enum WaitStrategy {
    /// The same wait every time.
    Fixed(f64),
    /// Per-attempt waits, index = attempt - 1, last value reused.
    Sequence(Vec<f64>),
    /// `base * 2^(attempt-1)`, the YAML `wait: "expo"` form.
    Exponential { base: f64 },
    /// Caller-supplied schedule.
    Custom(Arc<dyn Fn(u32) -> f64 + Send + Sync>),
}

impl std::fmt::Debug for WaitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(secs) => f.debug_tuple("Fixed").field(secs).finish(),
            Self::Sequence(waits) => f.debug_tuple("Sequence").field(waits).finish(),
            Self::Exponential { base } => {
                f.debug_struct("Exponential").field("base", base).finish()
            }
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl WaitStrategy {
    /// Wait before retry number `attempt` (1-based: the wait after the
    /// first failure is `wait_for(1)`).
    #[must_use]
    pub fn wait_for(&self, attempt: u32) -> f64 {
        match self {
            Self::Fixed(secs) => *secs,
            Self::Sequence(waits) => {
                if waits.is_empty() {
                    return 0.0;
                }
                let index = (attempt as usize).saturating_sub(1).min(waits.len() - 1);
                waits[index]
            }
            Self::Exponential { base } => base * 2f64.powi(attempt.saturating_sub(1) as i32),
            Self::Custom(f) => f(attempt),
        }
    }
}

/// A complete retry specification.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: WaitStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, wait: WaitStrategy::Fixed(1.0) }
    }
}

/// Runs `op` up to `policy.max_attempts` times.
///
/// Errors for which `retry_on` returns `false` propagate immediately. Sleeps
/// happen between attempts, never before the first; after the final attempt
/// the last error is returned as-is.
///
/// # Errors
///
/// The final error from `op` once attempts are exhausted, or the first
/// non-retryable error.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    retry_on: P,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
    P: Fn(&GatewayError) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            tracing::debug!(attempt, max_attempts = attempts, "retrying after failure");
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !retry_on(&error) || attempt == attempts {
                    return Err(error);
                }
                let wait = policy.wait.wait_for(attempt);
                tracing::debug!(
                    attempt,
                    wait_s = wait,
                    error = %error,
                    "attempt failed, backing off"
                );
                last_error = Some(error);
                if wait > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
            }
        }
    }

    // Unreachable: the loop always returns on the final attempt.
    Err(last_error.unwrap_or_else(|| GatewayError::Internal("retry loop exhausted".to_string())))
}
