//! Integration tests for the Portico gateway.
//!
//! Test modules:
//!
//! - `throttle_scenarios`: end-to-end admission timelines for the four
//!   rate-limit algorithms, plus model-equivalence property tests
//! - `cache_tests`: cache hit/miss/expiry through the pipeline and
//!   single-flight behaviour under concurrency
//! - `reliability_tests`: retry schedules and circuit breaker lifecycles
//!   observed through the pipeline
//! - `pipeline_tests`: feature composition, auth surfaces, error statuses
//!   and telemetry events
//! - `router_tests`: specificity ordering and resolution determinism
//! - `config_reload_tests`: snapshot swaps and reload equivalence
//! - `mock_infrastructure`: scripted upstream applications and gateway
//!   construction helpers
//!
//! Everything runs against the in-memory store with an injected clock, so
//! the timelines from the algorithm contracts can be asserted exactly
//! without real sleeps (except where a test exercises actual timers).

#[cfg(test)]
mod throttle_scenarios;

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod reliability_tests;

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod router_tests;

#[cfg(test)]
mod config_reload_tests;
