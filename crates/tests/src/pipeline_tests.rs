//! Feature composition through the full pipeline: auth surfaces, error
//! statuses, deadlines, default policies, forwarding, and telemetry.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use portico_core::{
    config::GatewayConfig,
    gateway::{Gateway, WsPlan},
    store::InMemoryStore,
    types::GatewayRequest,
};

use crate::mock_infrastructure::{gateway_with_clock, spawn_http_backend, MockApp};

fn basic_auth_header(user: &str, pass: &str) -> HeaderValue {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
}

const AUTH_CONFIG: &str = r#"
portico:
  paths:
    - pattern: "/admin/**"
      features:
        auth:
          type: "basic"
          username: "admin"
          password: "hunter2"
          rbac:
            roles:
              admin: ["*:*"]
              viewer: ["read:admin"]
            user_roles:
              admin: ["viewer"]
            route_permissions:
              "/admin/keys/**": ["write:admin"]
"#;

#[tokio::test]
async fn missing_credentials_get_401() {
    let app = MockApp::ok("secret");
    let (gateway, _clock) = gateway_with_clock(AUTH_CONFIG, app.clone()).await;
    let mut events = gateway.events().subscribe();

    let response = gateway.handle(GatewayRequest::get("/admin/panel")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.calls(), 0, "unauthenticated requests never reach the app");

    let event = events.recv().await.unwrap();
    assert_eq!(event.status, 401);
    assert_eq!(event.error_kind.as_deref(), Some("unauthenticated"));
}

#[tokio::test]
async fn valid_credentials_pass_through() {
    let app = MockApp::ok("secret");
    let (gateway, _clock) = gateway_with_clock(AUTH_CONFIG, app.clone()).await;

    let mut request = GatewayRequest::get("/admin/panel");
    request.headers.insert(http::header::AUTHORIZATION, basic_auth_header("admin", "hunter2"));

    let response = gateway.handle(request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"secret"));
}

#[tokio::test]
async fn missing_permission_gets_403() {
    let app = MockApp::ok("keys");
    let (gateway, _clock) = gateway_with_clock(AUTH_CONFIG, app.clone()).await;

    // "admin" authenticates fine but only holds the viewer role, which
    // cannot write:admin.
    let mut request = GatewayRequest::get("/admin/keys/rotate");
    request.headers.insert(http::header::AUTHORIZATION, basic_auth_header("admin", "hunter2"));

    let response = gateway.handle(request).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(app.calls(), 0);
}

#[tokio::test]
async fn rate_limit_uses_configured_error_surface() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 2
          duration: 60
          algorithm: "fixed_window"
          error_status: 420
          error_message: "enhance your calm"
"#;
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(yaml, app.clone()).await;
    let mut events = gateway.events().subscribe();

    for _ in 0..2 {
        assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);
    }

    let limited = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(limited.status.as_u16(), 420);
    let body: serde_json::Value = serde_json::from_slice(&limited.body).unwrap();
    assert_eq!(body["error"], "enhance your calm");
    assert_eq!(app.calls(), 2);

    // First two events pass, the third is throttled.
    events.recv().await.unwrap();
    events.recv().await.unwrap();
    let event = events.recv().await.unwrap();
    assert!(event.throttled);
    assert_eq!(event.error_kind.as_deref(), Some("quota_exceeded"));
}

#[tokio::test]
async fn error_body_negotiates_plain_text() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 1
          duration: 60
"#;
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(yaml, app).await;

    gateway.handle(GatewayRequest::get("/api/x")).await;

    let mut request = GatewayRequest::get("/api/x");
    request.headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/plain"));
    let limited = gateway.handle(request).await;

    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        limited.headers.get(http::header::CONTENT_TYPE).unwrap(),
        "text/plain"
    );
    assert_eq!(limited.body, Bytes::from_static(b"Rate limit exceeded"));
}

#[tokio::test]
async fn deadline_aborts_slow_upstream() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/slow/*"
      features:
        timeout:
          seconds: 0.05
"#;
    let app = MockApp::delay(Duration::from_millis(300), "too late");
    let (gateway, _clock) = gateway_with_clock(yaml, app).await;
    let mut events = gateway.events().subscribe();

    let started = std::time::Instant::now();
    let response = gateway.handle(GatewayRequest::get("/slow/op")).await;

    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_millis(250), "deadline must cut the wait short");

    let event = events.recv().await.unwrap();
    assert!(event.timed_out);
    assert_eq!(event.error_kind.as_deref(), Some("timed_out"));
}

#[tokio::test]
async fn default_features_cover_unmatched_paths() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 1
          duration: 60
  default_features:
    rate_limit:
      quota: 2
      duration: 60
"#;
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(yaml, app).await;

    // The unmatched path gets the default quota of 2.
    assert_eq!(gateway.handle(GatewayRequest::get("/other")).await.status, StatusCode::OK);
    assert_eq!(gateway.handle(GatewayRequest::get("/other")).await.status, StatusCode::OK);
    assert_eq!(
        gateway.handle(GatewayRequest::get("/other")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn unmatched_path_without_default_passes_straight_through() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 1
          duration: 60
"#;
    let app = MockApp::ok("plain");
    let (gateway, _clock) = gateway_with_clock(yaml, app.clone()).await;

    for _ in 0..5 {
        let response = gateway.handle(GatewayRequest::get("/unmatched")).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(app.calls(), 5, "no policy, no features, straight to the app");
}

#[tokio::test]
async fn standalone_mode_forwards_to_backend() {
    let (backend_url, _handle) = spawn_http_backend("hello from backend").await;
    let yaml = format!(
        r#"
portico:
  keyspace: "fwd-test"
  servers:
    - "{backend_url}"
  paths:
    - pattern: "/api/*"
      features:
        timeout:
          seconds: 5.0
"#
    );
    let config = GatewayConfig::from_yaml(&yaml).unwrap();
    let gateway = Gateway::builder(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .without_background_tasks()
        .build()
        .await
        .unwrap();

    let response = gateway.handle(GatewayRequest::get("/api/echo")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"hello from backend"));
}

#[tokio::test]
async fn websocket_plan_respects_auth_and_mode() {
    let app = MockApp::ok("unused");
    let (gateway, _clock) = gateway_with_clock(AUTH_CONFIG, app).await;

    // Upgrade on a protected path without credentials is rejected.
    let rejected = gateway.plan_websocket(&GatewayRequest::get("/admin/feed")).await;
    match rejected {
        Err(response) => assert_eq!(response.status, StatusCode::UNAUTHORIZED),
        Ok(plan) => panic!("expected rejection, got {plan:?}"),
    }

    // With credentials, plugin mode passes the socket through.
    let mut request = GatewayRequest::get("/admin/feed");
    request.headers.insert(http::header::AUTHORIZATION, basic_auth_header("admin", "hunter2"));
    assert_eq!(gateway.plan_websocket(&request).await.unwrap(), WsPlan::PassThrough);
}

#[tokio::test]
async fn websocket_plan_targets_backend_in_standalone_mode() {
    let yaml = r#"
portico:
  servers:
    - "http://127.0.0.1:9001"
"#;
    let config = GatewayConfig::from_yaml(yaml).unwrap();
    let gateway = Gateway::builder(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .without_background_tasks()
        .build()
        .await
        .unwrap();

    let mut request = GatewayRequest::get("/live/feed");
    request.query = "room=7".to_string();
    match gateway.plan_websocket(&request).await.unwrap() {
        WsPlan::Forward { target_url } => {
            assert_eq!(target_url, "ws://127.0.0.1:9001/live/feed?room=7");
        }
        WsPlan::PassThrough => panic!("standalone mode must forward"),
    }
}

#[tokio::test]
async fn event_reports_latency_and_pattern() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        monitoring:
          log_threshold: 10.0
"#;
    let app = MockApp::delay(Duration::from_millis(30), "done");
    let (gateway, _clock) = gateway_with_clock(yaml, app).await;
    let mut events = gateway.events().subscribe();

    gateway.handle(GatewayRequest::get("/api/timed")).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.matched_pattern.as_deref(), Some("/api/*"));
    assert_eq!(event.method, "GET");
    assert!(event.latency_ms >= 25, "latency must include the upstream time");
    assert!(!event.cache_hit);
    assert!(!event.throttled);
}
