//! Per-request telemetry fan-out.
//!
//! The pipeline emits one [`RequestEvent`] per request over a broadcast
//! channel. Emission never blocks and never fails the request: with no
//! subscribers the event is dropped, and a slow subscriber that lags past
//! the channel capacity loses the oldest events rather than stalling the
//! data plane.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::CircuitState;

const CHANNEL_CAPACITY: usize = 1024;

/// One request's worth of telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub path: String,
    pub method: String,
    /// Pattern that resolved the policy, or `None` for default features.
    pub matched_pattern: Option<String>,
    pub status: u16,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub throttled: bool,
    /// Retries performed beyond the first attempt.
    pub retried: u32,
    pub timed_out: bool,
    /// Breaker state observed for the request, when the feature was active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<&'static str>,
    /// Error kind label when the request failed, per the error taxonomy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl RequestEvent {
    /// Baseline event for a request before the pipeline learns anything.
    #[must_use]
    pub fn started(method: &http::Method, path: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
            matched_pattern: None,
            status: 0,
            latency_ms: 0,
            cache_hit: false,
            throttled: false,
            retried: 0,
            timed_out: false,
            circuit_state: None,
            error_kind: None,
        }
    }

    pub fn set_circuit_state(&mut self, state: CircuitState) {
        self.circuit_state = Some(state.as_str());
    }
}

/// Non-blocking broadcast of request events to any number of observers.
pub struct EventSink {
    sender: broadcast::Sender<RequestEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Registers an observer. Dropping the receiver unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.sender.subscribe()
    }

    /// Emits an event; a send with no subscribers is not an error.
    pub fn emit(&self, event: RequestEvent) {
        tracing::trace!(
            path = %event.path,
            status = event.status,
            latency_ms = event.latency_ms,
            cache_hit = event.cache_hit,
            "request completed"
        );
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers, for host diagnostics.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
