//! Admission timelines for the four algorithms, plus model-equivalence
//! property tests: a reference implementation of each algorithm's
//! arithmetic is driven with random parameters and timelines, and the
//! store-backed engine must make the same decision at every step.

use std::sync::Arc;

use portico_core::{
    errors::GatewayError,
    store::{Clock, InMemoryStore, ManualClock},
    throttle::{Admission, ThrottleAlgo, ThrottlePolicy, Throttler},
};
use proptest::prelude::*;

fn throttler() -> (Throttler, ManualClock) {
    let (clock, handle) = Clock::manual();
    let store = Arc::new(InMemoryStore::with_clock(clock));
    (Throttler::new(store, "scenario"), handle)
}

async fn acquire(throttler: &Throttler, policy: &ThrottlePolicy) -> Result<Admission, GatewayError> {
    throttler.acquire("k", policy).await
}

// Scenario: fixed window, quota=3 duration=5. Requests at t=0,1,2 succeed;
// at t=3 the wait is ~2s; at t=5 (past the boundary) the window rolls.
#[tokio::test]
async fn fixed_window_timeline() {
    let (throttler, clock) = throttler();
    let policy = ThrottlePolicy::new(ThrottleAlgo::FixedWindow, 3, 5);

    for t in [0.0, 1.0, 2.0] {
        clock.set(t);
        assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
    }

    clock.set(3.0);
    match acquire(&throttler, &policy).await.unwrap() {
        Admission::RetryAfter(wait) => assert!((wait - 2.0).abs() < 1e-9),
        other => panic!("expected rejection at t=3, got {other:?}"),
    }

    clock.set(5.01);
    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
}

// Scenario: token bucket, quota=2 duration=2. A burst of two succeeds, the
// third waits ~1s for a refill, and a token is back at t=1.
#[tokio::test]
async fn token_bucket_timeline() {
    let (throttler, clock) = throttler();
    let policy = ThrottlePolicy::new(ThrottleAlgo::TokenBucket, 2, 2);

    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);

    match acquire(&throttler, &policy).await.unwrap() {
        Admission::RetryAfter(wait) => assert!((wait - 1.0).abs() < 1e-9),
        other => panic!("expected rejection, got {other:?}"),
    }

    clock.set(1.0);
    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
}

#[tokio::test]
async fn sliding_window_smooths_across_boundary() {
    let (throttler, clock) = throttler();
    let policy = ThrottlePolicy::new(ThrottleAlgo::SlidingWindow, 4, 10);

    for _ in 0..4 {
        assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
    }
    assert!(matches!(
        acquire(&throttler, &policy).await.unwrap(),
        Admission::RetryAfter(_)
    ));

    // One full window later the carried count has decayed by a full quota.
    clock.set(10.0);
    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
}

#[tokio::test]
async fn leaky_bucket_fills_drains_and_rejects() {
    let (throttler, clock) = throttler();
    let policy = ThrottlePolicy::new(ThrottleAlgo::LeakyBucket, 2, 2).with_bucket_size(3);

    // Levels 0,1,2 admit (with growing drain delays), level 3 is full.
    assert_eq!(acquire(&throttler, &policy).await.unwrap(), Admission::Admitted);
    assert!(matches!(acquire(&throttler, &policy).await.unwrap(), Admission::Delayed(_)));
    assert!(matches!(acquire(&throttler, &policy).await.unwrap(), Admission::Delayed(_)));
    assert!(matches!(acquire(&throttler, &policy).await, Err(GatewayError::BucketFull)));

    // Draining at quota/duration = 1/s opens capacity again.
    clock.set(2.0);
    assert!(matches!(
        acquire(&throttler, &policy).await.unwrap(),
        Admission::Admitted | Admission::Delayed(_)
    ));
}

// ---------------------------------------------------------------------------
// Model equivalence: reference arithmetic vs the store-backed engine.
// ---------------------------------------------------------------------------

/// Decision mirrored by all reference models.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ModelDecision {
    Admit,
    AdmitDelayed,
    Reject,
    Full,
}

fn classify(result: &Result<Admission, GatewayError>) -> ModelDecision {
    match result {
        Ok(Admission::Admitted) => ModelDecision::Admit,
        Ok(Admission::Delayed(_)) => ModelDecision::AdmitDelayed,
        Ok(Admission::RetryAfter(_)) => ModelDecision::Reject,
        Err(GatewayError::BucketFull) => ModelDecision::Full,
        Err(other) => panic!("unexpected error from acquire: {other:?}"),
    }
}

#[derive(Default)]
struct FixedWindowModel {
    window_end: f64,
    count: f64,
}

impl FixedWindowModel {
    fn step(&mut self, now: f64, quota: u32, duration: u64) -> ModelDecision {
        #[allow(clippy::cast_precision_loss)]
        let duration = duration as f64;
        if self.window_end == 0.0 || now > self.window_end {
            self.window_end = now + duration;
            self.count = 1.0;
            return ModelDecision::Admit;
        }
        if self.count >= f64::from(quota) {
            return ModelDecision::Reject;
        }
        self.count += 1.0;
        ModelDecision::Admit
    }
}

struct TokenBucketModel {
    last: f64,
    tokens: f64,
    initialized: bool,
}

impl TokenBucketModel {
    fn new() -> Self {
        Self { last: 0.0, tokens: 0.0, initialized: false }
    }

    fn step(&mut self, now: f64, quota: u32, duration: u64) -> ModelDecision {
        #[allow(clippy::cast_precision_loss)]
        let duration = duration as f64;
        let quota = f64::from(quota);
        if !self.initialized {
            self.last = now;
            self.tokens = quota;
            self.initialized = true;
        }
        let rate = quota / duration;
        let refilled = quota.min(self.tokens + (now - self.last) * rate);
        if refilled < 1.0 {
            return ModelDecision::Reject;
        }
        self.last = now;
        self.tokens = refilled - 1.0;
        ModelDecision::Admit
    }
}

struct LeakyBucketModel {
    last_leak: f64,
    level: f64,
    initialized: bool,
}

impl LeakyBucketModel {
    fn new() -> Self {
        Self { last_leak: 0.0, level: 0.0, initialized: false }
    }

    fn step(&mut self, now: f64, quota: u32, duration: u64, bucket_size: u32) -> ModelDecision {
        #[allow(clippy::cast_precision_loss)]
        let duration = duration as f64;
        let rate = f64::from(quota) / duration;
        if !self.initialized {
            self.last_leak = now;
            self.initialized = true;
        }
        // The stored bucket carries a TTL of two windows from its last
        // write, so a long-idle bucket reads as empty.
        if now - self.last_leak > 2.0 * duration {
            self.level = 0.0;
            self.last_leak = now;
        }
        let drained = (self.level - (now - self.last_leak) * rate).max(0.0);
        if drained >= f64::from(bucket_size) {
            // A full-bucket rejection writes nothing, so the model state
            // stays put too.
            return ModelDecision::Full;
        }
        self.last_leak = now;
        self.level = drained + 1.0;
        if self.level - 1.0 > 0.0 {
            ModelDecision::AdmitDelayed
        } else {
            ModelDecision::Admit
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fixed_window_matches_reference_model(
        quota in 1u32..20,
        duration in 1u64..30,
        deltas in prop::collection::vec(0u32..7, 1..60),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (throttler, clock) = throttler();
            let policy = ThrottlePolicy::new(ThrottleAlgo::FixedWindow, quota, duration);
            let mut model = FixedWindowModel::default();
            let mut now = 0.0;

            for delta in deltas {
                now += f64::from(delta);
                clock.set(now);
                let engine = classify(&throttler.acquire("k", &policy).await);
                let reference = model.step(now, quota, duration);
                prop_assert_eq!(engine, reference, "diverged at t={}", now);
            }
            Ok(())
        })?;
    }

    #[test]
    fn token_bucket_matches_reference_model(
        quota in 1u32..20,
        duration in 1u64..30,
        deltas in prop::collection::vec(0u32..7, 1..60),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (throttler, clock) = throttler();
            let policy = ThrottlePolicy::new(ThrottleAlgo::TokenBucket, quota, duration);
            let mut model = TokenBucketModel::new();
            let mut now = 0.0;

            for delta in deltas {
                now += f64::from(delta);
                clock.set(now);
                let engine = classify(&throttler.acquire("k", &policy).await);
                let reference = model.step(now, quota, duration);
                prop_assert_eq!(engine, reference, "diverged at t={}", now);
            }
            Ok(())
        })?;
    }

    #[test]
    fn leaky_bucket_matches_reference_model(
        quota in 1u32..10,
        duration in 1u64..20,
        bucket_size in 1u32..10,
        deltas in prop::collection::vec(0u32..5, 1..60),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (throttler, clock) = throttler();
            let policy = ThrottlePolicy::new(ThrottleAlgo::LeakyBucket, quota, duration)
                .with_bucket_size(bucket_size);
            let mut model = LeakyBucketModel::new();
            let mut now = 0.0;

            for delta in deltas {
                now += f64::from(delta);
                clock.set(now);
                let engine = classify(&throttler.acquire("k", &policy).await);
                let reference = model.step(now, quota, duration, bucket_size);
                prop_assert_eq!(engine, reference, "diverged at t={}", now);
            }
            Ok(())
        })?;
    }

    // Burst-allowance bound: over any timeline, token bucket admissions
    // cannot exceed the refill budget plus one full burst.
    #[test]
    fn token_bucket_respects_burst_bound(
        quota in 1u32..10,
        duration in 1u64..10,
        deltas in prop::collection::vec(0u32..3, 1..80),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (throttler, clock) = throttler();
            let policy = ThrottlePolicy::new(ThrottleAlgo::TokenBucket, quota, duration);
            let mut now = 0.0;
            let mut admitted = 0u32;

            for delta in &deltas {
                now += f64::from(*delta);
                clock.set(now);
                if matches!(throttler.acquire("k", &policy).await, Ok(Admission::Admitted)) {
                    admitted += 1;
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let budget = f64::from(quota) * now / (duration as f64) + f64::from(quota);
            prop_assert!(
                f64::from(admitted) <= budget + 1e-6,
                "admitted {} exceeds budget {}",
                admitted,
                budget
            );
            Ok(())
        })?;
    }

    // Smoothness bound: sliding window admissions in any window-length
    // interval never exceed twice the quota.
    #[test]
    fn sliding_window_respects_smoothness_bound(
        quota in 1u32..10,
        duration in 2u64..15,
        deltas in prop::collection::vec(0u32..4, 1..80),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let (throttler, clock) = throttler();
            let policy = ThrottlePolicy::new(ThrottleAlgo::SlidingWindow, quota, duration);
            let mut now = 0.0;
            let mut admitted_at: Vec<f64> = Vec::new();

            for delta in &deltas {
                now += f64::from(*delta);
                clock.set(now);
                if matches!(throttler.acquire("k", &policy).await, Ok(Admission::Admitted)) {
                    admitted_at.push(now);
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let window = duration as f64;
            for &start in &admitted_at {
                let in_window = admitted_at
                    .iter()
                    .filter(|&&t| t >= start && t < start + window)
                    .count();
                prop_assert!(
                    in_window <= (2 * quota) as usize,
                    "{} admissions in a {}s window with quota {}",
                    in_window,
                    window,
                    quota
                );
            }
            Ok(())
        })?;
    }
}
