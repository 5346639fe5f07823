//! Transport-agnostic request/response types and key derivation helpers.
//!
//! The gateway core never touches the wire. The embedding host converts its
//! native representation (axum, hyper, a test harness) into [`GatewayRequest`]
//! and back from [`GatewayResponse`]. Everything in between operates on these
//! types plus [`bytes::Bytes`] bodies.

use std::hash::{BuildHasher, Hash, Hasher};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

/// Categories under which shared state is namespaced in the KV store.
///
/// Every key the gateway writes has the shape `{keyspace}:{category}:{rest}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCategory {
    /// Rate-limit bucket state.
    Throttle,
    /// Cached responses and computed results.
    Cache,
    /// Circuit breaker state machines.
    CircuitBreaker,
    /// Load balancer bookkeeping.
    LoadBalancer,
}

impl KeyCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Throttle => "throttle",
            Self::Cache => "cache",
            Self::CircuitBreaker => "cb",
            Self::LoadBalancer => "lb",
        }
    }
}

/// Builds a fully-qualified store key: `{keyspace}:{category}:{logical_key}`.
#[must_use]
pub fn scoped_key(keyspace: &str, category: KeyCategory, logical_key: &str) -> String {
    format!("{keyspace}:{}:{logical_key}", category.as_str())
}

/// An incoming request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    /// Path component only, e.g. `/api/users`.
    pub path: String,
    /// Raw query string without the leading `?`, empty if absent.
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Client address as reported by the listener, for throttle keying and logs.
    pub remote_addr: Option<String>,
}

impl GatewayRequest {
    /// Convenience constructor for the common GET case.
    #[must_use]
    pub fn get(path: &str) -> Self {
        Self {
            method: Method::GET,
            path: path.to_string(),
            query: String::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    /// Returns the value of a header, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Query string with parameters sorted by name, for stable cache keys.
    #[must_use]
    pub fn sorted_query(&self) -> String {
        if self.query.is_empty() {
            return String::new();
        }
        let mut pairs: Vec<&str> = self.query.split('&').collect();
        pairs.sort_unstable();
        pairs.join("&")
    }

    /// Returns `true` when the request `Accept` header prefers JSON.
    ///
    /// Missing or wildcard accept headers default to JSON, matching the error
    /// bodies the gateway emits by default.
    #[must_use]
    pub fn accepts_json(&self) -> bool {
        match self.header("accept") {
            None => true,
            Some(accept) => {
                accept.contains("application/json") || accept.contains("*/*") ||
                    !accept.contains("text/")
            }
        }
    }
}

/// The response a pipeline run produces.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    /// Builds a response with a single `content-type` header.
    #[must_use]
    pub fn with_content_type(status: StatusCode, content_type: &str, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = http::HeaderValue::from_str(content_type) {
            headers.insert(http::header::CONTENT_TYPE, value);
        }
        Self { status, headers, body }
    }

    /// Builds an error response, negotiating JSON vs text from the request.
    #[must_use]
    pub fn error(request: &GatewayRequest, status: StatusCode, message: &str) -> Self {
        if request.accepts_json() {
            let body = serde_json::json!({ "error": message }).to_string();
            Self::with_content_type(status, "application/json", Bytes::from(body))
        } else {
            Self::with_content_type(status, "text/plain", Bytes::from(message.to_string()))
        }
    }

    /// Statuses worth caching, mirroring the heuristically cacheable set.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(self.status.as_u16(), 200 | 203 | 204 | 301 | 404 | 410)
    }
}

/// Circuit breaker position for a policy key.
///
/// Persisted in the store as a hash field and attached to telemetry events.
/// Transitions: `Closed` -> `Open` at the failure threshold, `Open` ->
/// `HalfOpen` after the recovery timeout, `HalfOpen` -> `Closed` on a
/// successful probe or back to `Open` on a failed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Persisted numeric form, used in store hashes.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    /// Inverse of [`CircuitState::as_u8`]; unknown values read as `Closed`.
    #[must_use]
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Identity attached to a request by a successful auth check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable identifier: username for basic auth, `sub` claim for JWT.
    pub id: String,
    /// Roles resolved from RBAC configuration, empty when RBAC is off.
    pub roles: Vec<String>,
}

/// Fixed-seed hasher so cache keys agree across processes sharing a store.
fn stable_hasher() -> ahash::AHasher {
    ahash::RandomState::with_seeds(
        0x6a09_e667_f3bc_c908,
        0xbb67_ae85_84ca_a73b,
        0x3c6e_f372_fe94_f82b,
        0xa54f_f53a_5f1d_36f1,
    )
    .build_hasher()
}

/// Derives the cache digest for an HTTP request.
///
/// The digest covers method, path, the sorted query string, and the values of
/// any configured vary headers. Two requests with the same digest are served
/// the same cached entry.
#[must_use]
pub fn response_cache_digest(request: &GatewayRequest, vary_headers: &[String]) -> String {
    let mut hasher = stable_hasher();
    request.method.as_str().hash(&mut hasher);
    request.path.hash(&mut hasher);
    request.sorted_query().hash(&mut hasher);
    for name in vary_headers {
        name.hash(&mut hasher);
        request.header(name).unwrap_or("").hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}
