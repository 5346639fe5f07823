//! Retry schedules, circuit breaker lifecycles, and backend health observed
//! through the pipeline.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::StatusCode;
use portico_core::{
    config::GatewayConfig,
    gateway::Gateway,
    store::InMemoryStore,
    types::GatewayRequest,
    upstream::LoadBalancer,
};

use crate::mock_infrastructure::{gateway_with_clock, spawn_http_backend, MockApp};

// Scenario: retry max_attempts=3 wait=[0.1, 0.2]; the upstream fails twice
// then succeeds. The client sees success, the elapsed time covers both
// waits, and the event reports two retries.
#[tokio::test]
async fn retry_recovers_after_two_failures() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        retry:
          max_attempts: 3
          wait: [0.1, 0.2]
"#;
    let app = MockApp::fail_first(2, "finally");
    let (gateway, _clock) = gateway_with_clock(yaml, app.clone()).await;
    let mut events = gateway.events().subscribe();

    let started = std::time::Instant::now();
    let response = gateway.handle(GatewayRequest::get("/api/thing")).await;
    let elapsed = started.elapsed();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"finally"));
    assert_eq!(app.calls(), 3);
    assert!(elapsed >= Duration::from_millis(300), "waits 0.1s + 0.2s must elapse");
    assert!(elapsed < Duration::from_secs(2));

    let event = events.recv().await.unwrap();
    assert_eq!(event.retried, 2);
    assert_eq!(event.status, 200);
}

#[tokio::test]
async fn retries_exhausted_surface_bad_gateway() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        retry:
          max_attempts: 3
          wait: 0.01
"#;
    let app = MockApp::always_fail();
    let (gateway, _clock) = gateway_with_clock(yaml, app.clone()).await;

    let response = gateway.handle(GatewayRequest::get("/api/thing")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 3, "all attempts consumed");
}

// Scenario: breaker failure_threshold=2 recovery_timeout=1. Two failures
// open the circuit; the third request short-circuits with 502 without
// reaching the app. After the recovery timeout one probe goes through; its
// failure re-opens the circuit immediately.
#[tokio::test]
async fn circuit_breaker_lifecycle() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        circuit_breaker:
          failure_threshold: 2
          recovery_timeout: 1.0
"#;
    let app = MockApp::always_fail();
    let (gateway, clock) = gateway_with_clock(yaml, app.clone()).await;

    for _ in 0..2 {
        let response = gateway.handle(GatewayRequest::get("/api/x")).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    }
    assert_eq!(app.calls(), 2);

    // Open: short-circuits without an upstream call.
    let response = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 2, "open circuit must not reach the app");

    // Past the recovery timeout the next request probes and fails.
    clock.set(1.5);
    let response = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 3, "probe reaches the app");

    // Failed probe re-opened the circuit.
    let response = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 3);
}

#[tokio::test]
async fn circuit_closes_after_successful_probe() {
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        circuit_breaker:
          failure_threshold: 1
          recovery_timeout: 1.0
"#;
    let app = MockApp::fail_first(1, "healed");
    let (gateway, clock) = gateway_with_clock(yaml, app.clone()).await;

    assert_eq!(
        gateway.handle(GatewayRequest::get("/api/x")).await.status,
        StatusCode::BAD_GATEWAY
    );

    clock.set(2.0);
    let probe = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(probe.status, StatusCode::OK, "successful probe serves the response");

    // Closed again: requests flow normally.
    let response = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(app.calls(), 3);
}

#[tokio::test]
async fn retry_observes_breaker_state() {
    // Retry wraps the breaker: once the first attempt's failure opens the
    // circuit, the remaining attempts see CircuitOpen instead of hammering
    // the upstream.
    let yaml = r#"
portico:
  paths:
    - pattern: "/api/*"
      features:
        retry:
          max_attempts: 3
          wait: 0.01
        circuit_breaker:
          failure_threshold: 1
          recovery_timeout: 60.0
"#;
    let app = MockApp::always_fail();
    let (gateway, _clock) = gateway_with_clock(yaml, app.clone()).await;

    let response = gateway.handle(GatewayRequest::get("/api/x")).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(app.calls(), 1, "attempts after the circuit opened are short-circuited");
}

#[tokio::test]
async fn standalone_unreachable_backend_becomes_unhealthy() {
    // One backend that refuses connections: the first request surfaces 502
    // and trips the health threshold, the second gets 503 because the pool
    // is empty.
    let yaml = r#"
portico:
  keyspace: "standalone-test"
  servers:
    - "http://127.0.0.1:1"
  default_features:
    circuit_breaker:
      failure_threshold: 1
      recovery_timeout: 60.0
"#;
    let config = GatewayConfig::from_yaml(yaml).unwrap();
    let gateway = Gateway::builder(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .without_background_tasks()
        .build()
        .await
        .unwrap();

    let first = gateway.handle(GatewayRequest::get("/anything")).await;
    assert_eq!(first.status, StatusCode::BAD_GATEWAY);

    let second = gateway.handle(GatewayRequest::get("/anything")).await;
    assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);
}

// Scenario: pool of [A (down), B (up)]. Traffic is served by B; once A
// passes a probe, selection alternates across both backends.
#[tokio::test]
async fn probe_restores_downed_backend_to_rotation() {
    let (b_url, _b_handle) = spawn_http_backend("from-b").await;

    // Reserve a port for A, then free it so A starts down.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let a_addr = placeholder.local_addr().unwrap();
    drop(placeholder);
    let a_url = format!("http://{a_addr}");

    let balancer =
        Arc::new(LoadBalancer::new(&[a_url.clone(), b_url.clone()], 1));
    let client = reqwest::Client::new();

    // A refuses connections: one forwarding failure marks it down.
    {
        let backends = balancer.all_backends();
        let a = backends.iter().find(|b| b.url() == a_url).unwrap();
        balancer.record_failure(a);
    }
    for _ in 0..4 {
        let backend = balancer.next_healthy().expect("B is up");
        assert_eq!(backend.url(), b_url, "only B serves while A is down");
    }
    assert_eq!(balancer.healthy_count(), 1);

    // A comes up and passes a probe.
    let a_listener = tokio::net::TcpListener::bind(a_addr).await.unwrap();
    let _a_handle = tokio::spawn(accept_and_respond(a_listener));

    balancer.probe_unhealthy(&client).await;
    assert_eq!(balancer.healthy_count(), 2);

    // Rotation alternates across both again.
    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        seen.insert(balancer.next_healthy().unwrap().url().to_string());
    }
    assert_eq!(seen.len(), 2, "both backends take traffic after recovery");
}

async fn accept_and_respond(listener: tokio::net::TcpListener) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    loop {
        let Ok((mut socket, _)) = listener.accept().await else { break };
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await;
        let _ = socket.shutdown().await;
    }
}
