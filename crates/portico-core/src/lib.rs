//! # Portico Core
//!
//! Core library for the Portico pluggable HTTP/WebSocket API gateway.
//!
//! This crate provides the foundational components for:
//!
//! - **[`store`]**: Key/value abstraction with TTLs, hash fields and named atomic
//!   scripts. In-process sharded implementation plus a Redis-backed shared store.
//!
//! - **[`throttle`]**: Four rate-limiting algorithms (fixed window, sliding window,
//!   token bucket, leaky bucket) with a single admission contract, executed as
//!   atomic scripts against the store.
//!
//! - **[`cache`]**: TTL-keyed response caching with single-flight semantics so a
//!   cold key is produced exactly once across the deployment.
//!
//! - **[`reliability`]**: Retry with configurable wait schedules and a per-key
//!   circuit breaker state machine backed by the store.
//!
//! - **[`upstream`]**: Backend pool with round-robin load balancing, health
//!   probing, HTTP forwarding and WebSocket pumping.
//!
//! - **[`router`]**: Compiled path-pattern set mapping requests to policies,
//!   most-specific-wins, memoized with a bounded LRU.
//!
//! - **[`gateway`]**: The request pipeline that composes the features a resolved
//!   policy enables and runs them under a single timeout budget.
//!
//! ## Request Flow
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────┐
//! │  PathRouter │ ─── policy (FeatureSet)
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │    Auth     │ ─── Unauthenticated/Forbidden ──► 401 / 403
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │  Throttler  │ ─── QuotaExceeded ──► 429
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐
//! │ Cache Check │ ─── Hit ──► Cached Response
//! └──────┬──────┘
//!        │ Miss
//!        ▼
//! ┌───────────────────────────────────────┐
//! │ Deadline [ Retry [ Breaker [ Forward ]│ ──► Backend / wrapped app
//! └──────┬────────────────────────────────┘
//!        ▼
//!  Cache Insert ──► Event Sink ──► Response to Client
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod reliability;
pub mod router;
pub mod store;
pub mod throttle;
pub mod types;
pub mod upstream;
