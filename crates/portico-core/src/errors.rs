use thiserror::Error;

use crate::{store::StoreError, upstream::UpstreamError};

/// Errors surfaced by the request pipeline.
///
/// Each variant maps to a stable HTTP status via [`GatewayError::status_code`].
/// Throttle and cache failures are converted to responses inside the pipeline;
/// anything unmatched bubbles to the pipeline top and becomes a 500.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// A rate-limit policy rejected the request.
    #[error("quota exceeded, retry after {retry_after:.2}s")]
    QuotaExceeded {
        /// Seconds until one unit becomes admissible.
        retry_after: f64,
    },

    /// A leaky bucket has reached its configured size.
    #[error("bucket is full, cannot admit more requests")]
    BucketFull,

    /// The per-request deadline elapsed before the pipeline completed.
    #[error("request timed out after {seconds}s")]
    TimedOut { seconds: f64 },

    /// The circuit breaker for the matched policy is open.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Every backend in the pool is marked unhealthy.
    #[error("no healthy backend available")]
    NoHealthyBackend,

    /// Credentials were missing or failed validation.
    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    /// The authenticated principal lacks a required permission.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Forwarding to the upstream failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The key/value store misbehaved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Anything that escaped the typed paths above.
    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status the pipeline responds with for this error.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::QuotaExceeded { .. } | Self::BucketFull => StatusCode::TOO_MANY_REQUESTS,
            Self::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::CircuitOpen | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns `true` if a retry wrapper may re-attempt after this error.
    ///
    /// Only upstream transport failures and open breakers are worth retrying;
    /// policy rejections (quota, auth) and deadline expiry never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(e) => e.is_transient(),
            Self::CircuitOpen | Self::NoHealthyBackend => true,
            _ => false,
        }
    }

    /// Stable label for telemetry records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::BucketFull => "bucket_full",
            Self::TimedOut { .. } => "timed_out",
            Self::CircuitOpen => "circuit_open",
            Self::NoHealthyBackend => "no_healthy_backend",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Upstream(_) => "upstream_error",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal",
        }
    }
}
