use thiserror::Error;

/// Errors that can occur while talking to backend servers.
///
/// These are transport-level failures. Backend responses, including 5xx,
/// are forwarded to the client as responses and never appear here.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The forwarding request exceeded its deadline.
    #[error("upstream request timed out")]
    Timeout,

    /// The backend could not be reached at all.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A health probe or forward produced an unexpected HTTP status.
    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),

    /// Network-level error from the HTTP client.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A backend URL could not be parsed or joined with the request path.
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    /// WebSocket connect or pump failure.
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl UpstreamError {
    /// Returns `true` if the failure is worth retrying, possibly on a
    /// different backend.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionFailed(_) => true,
            Self::Network(error) => !error.is_builder() && !error.is_decode(),
            Self::HttpStatus(status) => (500..=599).contains(status) || *status == 429,
            Self::InvalidUrl(_) | Self::WebSocket(_) => false,
        }
    }
}
