//! HTTP request forwarding to backend servers.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use reqwest::{Client, ClientBuilder};

use crate::types::{GatewayRequest, GatewayResponse};

use super::errors::UpstreamError;

/// Headers that are connection-scoped and must not be forwarded either way.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Proxy-side HTTP client for standalone mode.
///
/// One instance is shared by all backends; reqwest pools connections per
/// host internally. Redirects are disabled so the client sees the backend's
/// own redirect responses.
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    /// Builds the forwarding client.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Network`] if the underlying client fails to
    /// build.
    pub fn new() -> Result<Self, UpstreamError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .user_agent(concat!("portico/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Returns a clone of the underlying client, for health probes.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Forwards `request` to `base_url` and converts the reply.
    ///
    /// Hop-by-hop headers are stripped in both directions. The optional
    /// `timeout` bounds this single exchange; the pipeline deadline usually
    /// cancels the whole future first.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] when the per-exchange timeout fires,
    /// [`UpstreamError::ConnectionFailed`] when the backend is unreachable,
    /// other [`UpstreamError::Network`] values for remaining client errors.
    pub async fn forward(
        &self,
        base_url: &str,
        request: &GatewayRequest,
        timeout: Option<Duration>,
    ) -> Result<GatewayResponse, UpstreamError> {
        let target = build_target_url(base_url, &request.path, &request.query);
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| UpstreamError::InvalidUrl(format!("bad method for {target}")))?;

        let mut builder = self.client.request(method, &target);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                UpstreamError::Timeout
            } else if error.is_connect() {
                UpstreamError::ConnectionFailed(format!("{target} unreachable"))
            } else {
                UpstreamError::Network(error)
            }
        })?;

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name.as_str()) {
                if let (Ok(name), Ok(value)) = (
                    http::header::HeaderName::try_from(name.as_str()),
                    http::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    headers.insert(name, value);
                }
            }
        }

        let body: Bytes = response.bytes().await.map_err(UpstreamError::Network)?;
        Ok(GatewayResponse { status, headers, body })
    }
}

/// Joins a backend base URL with a request path and query string.
#[must_use]
pub fn build_target_url(base_url: &str, path: &str, query: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if query.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{query}")
    }
}
