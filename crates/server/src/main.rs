//! Portico gateway server: an axum listener wired to the core pipeline.
//!
//! Every route falls through to the gateway; axum is only the wire. The
//! listener address and config path come from the environment:
//!
//! - `PORTICO_CONFIG`: config file path, default `config/gateway.yaml`
//! - `PORTICO_BIND`: listen address, default `127.0.0.1:8700`
//! - `RUST_LOG`: tracing filter, default `info`

mod bridge;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
    Router,
};
use portico_core::{
    config::{watcher::watch_config, GatewayConfig},
    gateway::{Gateway, WsPlan},
};
use tower_http::compression::CompressionLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,portico_core=info,server=info")
    });

    let json = std::env::var("PORTICO_LOG_FORMAT").as_deref() == Ok("json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    request: http::Request<axum::body::Body>,
) -> Response {
    let remote = Some(addr.to_string());

    // WebSocket upgrades run the policy prefix, then become a byte pump.
    if let Some(ws) = ws {
        let (parts, _body) = request.into_parts();
        let gateway_request = portico_core::types::GatewayRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or("").to_string(),
            headers: parts.headers,
            body: bytes::Bytes::new(),
            remote_addr: remote,
        };

        return match state.gateway.plan_websocket(&gateway_request).await {
            Ok(WsPlan::Forward { target_url }) => {
                ws.on_upgrade(move |socket| bridge::run_ws_proxy(socket, target_url))
            }
            Ok(WsPlan::PassThrough) => bridge::into_axum_response(
                portico_core::types::GatewayResponse::error(
                    &gateway_request,
                    http::StatusCode::NOT_IMPLEMENTED,
                    "websocket pass-through requires an embedded application",
                ),
            ),
            Err(rejection) => bridge::into_axum_response(rejection),
        };
    }

    let gateway_request = match bridge::into_gateway_request(request, remote).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let response = state.gateway.handle(gateway_request).await;
    bridge::into_axum_response(response)
}

/// Logs the event stream; stands in for the dashboard the core feeds.
fn spawn_event_logger(gateway: &Arc<Gateway>) {
    let mut events = gateway.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(
                        method = %event.method,
                        path = %event.path,
                        status = event.status,
                        latency_ms = event.latency_ms,
                        cache_hit = event.cache_hit,
                        throttled = event.throttled,
                        retried = event.retried,
                        "request"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config_path = PathBuf::from(
        std::env::var("PORTICO_CONFIG").unwrap_or_else(|_| "config/gateway.yaml".to_string()),
    );
    let bind: SocketAddr = std::env::var("PORTICO_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8700".to_string())
        .parse()
        .context("PORTICO_BIND is not a valid socket address")?;
    let max_connections: usize = std::env::var("PORTICO_MAX_CONNECTIONS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(4096);

    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let gateway = Arc::new(
        Gateway::builder(config)
            .build()
            .await
            .map_err(|e| anyhow::anyhow!("gateway initialization failed: {e}"))?,
    );

    // Hot reload: the watcher publishes validated snapshots, the gateway
    // swaps them in. A missing watch (e.g. the file was deleted) only
    // disables reload, it does not stop the server.
    match watch_config(config_path.clone()) {
        Ok((watcher, snapshots)) => {
            gateway.start_reload_task(snapshots);
            // Keep the watcher alive for the process lifetime.
            std::mem::forget(watcher);
        }
        Err(error) => {
            tracing::warn!(%error, "config hot reload disabled");
        }
    }

    spawn_event_logger(&gateway);

    let state = AppState { gateway };
    let app = Router::new()
        .fallback(proxy_handler)
        .layer(CompressionLayer::new())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .layer(axum::extract::DefaultBodyLimit::max(bridge::MAX_BODY_BYTES))
        .with_state(state);

    let listener =
        tokio::net::TcpListener::bind(bind).await.with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "portico listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
