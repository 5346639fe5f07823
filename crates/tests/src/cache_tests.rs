//! Cache behaviour through the pipeline: hits, expiry, single-flight, and
//! what never gets stored.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use http::{Method, StatusCode};
use portico_core::types::GatewayRequest;

use crate::mock_infrastructure::{gateway, gateway_with_clock, MockApp};

const CACHED_API: &str = r#"
portico:
  keyspace: "cache-test"
  paths:
    - pattern: "/api/users"
      features:
        cache:
          expire_s: 60
"#;

// Scenario: GET /api/users at t=0 forwards upstream; a repeat at t=10 is
// served from cache without touching the app; at t=61 the entry has expired
// and the app is hit again.
#[tokio::test]
async fn cache_hit_then_expiry_timeline() {
    let app = MockApp::ok("user-list");
    let (gateway, clock) = gateway_with_clock(CACHED_API, app.clone()).await;
    let mut events = gateway.events().subscribe();

    let first = gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body, Bytes::from_static(b"user-list"));
    assert_eq!(app.calls(), 1);
    assert!(!events.recv().await.unwrap().cache_hit);

    clock.set(10.0);
    let second = gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(second.body, Bytes::from_static(b"user-list"));
    assert_eq!(app.calls(), 1, "cache hit must not reach the app");
    assert!(events.recv().await.unwrap().cache_hit);

    clock.set(61.0);
    let third = gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(third.status, StatusCode::OK);
    assert_eq!(app.calls(), 2, "expired entry forwards again");
    assert!(!events.recv().await.unwrap().cache_hit);
}

#[tokio::test]
async fn concurrent_cold_key_produces_once() {
    let app = MockApp::delay(Duration::from_millis(50), "slow-value");
    let gateway = gateway(CACHED_API, app.clone()).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let gateway = Arc::clone(&gateway);
        handles.push(tokio::spawn(async move {
            gateway.handle(GatewayRequest::get("/api/users")).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"slow-value"));
    }
    assert_eq!(app.calls(), 1, "single-flight: one producer for ten callers");
}

#[tokio::test]
async fn non_idempotent_methods_bypass_the_cache() {
    let app = MockApp::ok("result");
    let (gateway, _clock) = gateway_with_clock(CACHED_API, app.clone()).await;

    let mut post = GatewayRequest::get("/api/users");
    post.method = Method::POST;

    gateway.handle(post.clone()).await;
    gateway.handle(post).await;
    assert_eq!(app.calls(), 2, "POST must reach the app every time");
}

#[tokio::test]
async fn error_statuses_are_not_stored() {
    let app = MockApp::status(StatusCode::INTERNAL_SERVER_ERROR);
    let (gateway, _clock) = gateway_with_clock(CACHED_API, app.clone()).await;

    let first = gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(first.status, StatusCode::INTERNAL_SERVER_ERROR);
    let second = gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(second.status, StatusCode::INTERNAL_SERVER_ERROR);

    assert_eq!(app.calls(), 2, "a 500 must not be served from cache");
}

#[tokio::test]
async fn not_found_is_cacheable() {
    let app = MockApp::status(StatusCode::NOT_FOUND);
    let (gateway, _clock) = gateway_with_clock(CACHED_API, app.clone()).await;

    gateway.handle(GatewayRequest::get("/api/users")).await;
    gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(app.calls(), 1, "404 is in the cacheable status set");
}

#[tokio::test]
async fn query_strings_partition_the_cache() {
    let app = MockApp::ok("page");
    let (gateway, _clock) = gateway_with_clock(CACHED_API, app.clone()).await;

    let mut page_one = GatewayRequest::get("/api/users");
    page_one.query = "page=1".to_string();
    let mut page_two = GatewayRequest::get("/api/users");
    page_two.query = "page=2".to_string();

    gateway.handle(page_one.clone()).await;
    gateway.handle(page_two).await;
    assert_eq!(app.calls(), 2, "different queries are different entries");

    gateway.handle(page_one).await;
    assert_eq!(app.calls(), 2, "repeat query is a hit");
}

#[tokio::test]
async fn host_can_invalidate_through_the_cache_handle() {
    let app = MockApp::ok("v1");
    let (gateway, _clock) = gateway_with_clock(CACHED_API, app.clone()).await;

    gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(app.calls(), 1);

    gateway.cache().clear(None).await.unwrap();

    gateway.handle(GatewayRequest::get("/api/users")).await;
    assert_eq!(app.calls(), 2, "cleared entry forwards again");
}
