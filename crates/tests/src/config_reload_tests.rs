//! Snapshot swaps: reloads change routing for new requests only, and
//! reloading identical YAML is behaviourally invisible.

use http::StatusCode;
use portico_core::{config::GatewayConfig, types::GatewayRequest};

use crate::mock_infrastructure::{gateway_with_clock, MockApp};

const BEFORE: &str = r#"
portico:
  keyspace: "reload-test"
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 1
          duration: 60
"#;

const AFTER: &str = r#"
portico:
  keyspace: "reload-test"
  paths:
    - pattern: "/api/*"
      features:
        rate_limit:
          quota: 100
          duration: 60
"#;

#[tokio::test]
async fn apply_config_changes_policy_for_new_requests() {
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(BEFORE, app).await;

    assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);
    assert_eq!(
        gateway.handle(GatewayRequest::get("/api/x")).await.status,
        StatusCode::TOO_MANY_REQUESTS,
        "old quota of 1 is exhausted"
    );

    let new_config = GatewayConfig::from_yaml(AFTER).unwrap();
    gateway.apply_config(&new_config).unwrap();

    // Bucket state survives (same keyspace), but the new quota admits more.
    for _ in 0..10 {
        assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);
    }
}

#[tokio::test]
async fn reloading_identical_config_is_invisible() {
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(BEFORE, app).await;

    assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);

    let same = GatewayConfig::from_yaml(BEFORE).unwrap();
    gateway.apply_config(&same).unwrap();

    // The single-admission bucket is still exhausted; the reload neither
    // reset state nor changed behaviour.
    assert_eq!(
        gateway.handle(GatewayRequest::get("/api/x")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn invalid_config_is_rejected_and_snapshot_kept() {
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(BEFORE, app).await;

    let mut broken = GatewayConfig::from_yaml(BEFORE).unwrap();
    broken.paths[0].features.rate_limit.as_mut().unwrap().quota = 0;
    assert!(gateway.apply_config(&broken).is_err());

    // The original quota-of-one policy still applies.
    assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);
    assert_eq!(
        gateway.handle(GatewayRequest::get("/api/x")).await.status,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn reload_can_add_and_remove_routes() {
    let app = MockApp::ok("ok");
    let (gateway, _clock) = gateway_with_clock(BEFORE, app.clone()).await;

    // /other is unmatched: no features, passes straight through.
    for _ in 0..3 {
        assert_eq!(gateway.handle(GatewayRequest::get("/other")).await.status, StatusCode::OK);
    }

    let with_other = GatewayConfig::from_yaml(
        r#"
portico:
  keyspace: "reload-test"
  paths:
    - pattern: "/other"
      features:
        rate_limit:
          quota: 1
          duration: 60
"#,
    )
    .unwrap();
    gateway.apply_config(&with_other).unwrap();

    assert_eq!(gateway.handle(GatewayRequest::get("/other")).await.status, StatusCode::OK);
    assert_eq!(
        gateway.handle(GatewayRequest::get("/other")).await.status,
        StatusCode::TOO_MANY_REQUESTS,
        "newly routed path is now limited"
    );

    // And /api/* no longer matches anything.
    for _ in 0..3 {
        assert_eq!(gateway.handle(GatewayRequest::get("/api/x")).await.status, StatusCode::OK);
    }
}
