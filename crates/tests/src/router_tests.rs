//! Resolution determinism and specificity ordering, including randomized
//! checks that a strictly less specific pattern never steals a resolution.

use http::Method;
use portico_core::router::PathRouter;
use proptest::prelude::*;

fn router(patterns: &[&str]) -> PathRouter<usize> {
    PathRouter::new(patterns.iter().enumerate().map(|(i, p)| ((*p).to_string(), i)).collect())
        .unwrap()
}

#[test]
fn specificity_order_is_prefix_then_wildcards_then_declaration() {
    let router = router(&[
        "/api/**",        // prefix 5, crosses segments
        "/api/users/*",   // prefix 11
        "/api/users/me",  // literal, prefix 14
    ]);

    let (pattern, _) = router.resolve(&Method::GET, "/api/users/me").unwrap();
    assert_eq!(pattern, "/api/users/me");

    let (pattern, _) = router.resolve(&Method::GET, "/api/users/42").unwrap();
    assert_eq!(pattern, "/api/users/*");

    let (pattern, _) = router.resolve(&Method::GET, "/api/orders/42").unwrap();
    assert_eq!(pattern, "/api/**");
}

#[test]
fn methods_share_pattern_matching() {
    let router = router(&["/api/*"]);
    for method in [Method::GET, Method::POST, Method::DELETE] {
        assert!(router.resolve(&method, "/api/x").is_some());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    // Determinism: resolving the same path repeatedly, cold or through the
    // LRU, always yields the same pattern.
    #[test]
    fn resolution_is_deterministic(
        segments in prop::collection::vec("[a-c]{1,3}", 1..4),
    ) {
        let router = router(&["/api/**", "/api/*", "/api/users/*", "/**"]);
        let path = format!("/api/{}", segments.join("/"));

        let first = router.resolve(&Method::GET, &path).map(|(p, _)| p.to_string());
        for _ in 0..3 {
            let again = router.resolve(&Method::GET, &path).map(|(p, _)| p.to_string());
            prop_assert_eq!(first.clone(), again);
        }
    }

    // Adding a strictly less specific pattern (shorter literal prefix than
    // every existing pattern) never changes an existing resolution.
    #[test]
    fn less_specific_pattern_never_steals(
        segments in prop::collection::vec("[a-c]{1,3}", 1..4),
    ) {
        let narrow = router(&["/api/**", "/api/users/*", "/api/users/me"]);
        let path = format!("/api/{}", segments.join("/"));
        let before = narrow.resolve(&Method::GET, &path).map(|(p, _)| p.to_string());

        // "/**" has a one-character literal prefix, shorter than "/api/".
        let widened = router(&["/api/**", "/api/users/*", "/api/users/me", "/**"]);
        let after = widened.resolve(&Method::GET, &path).map(|(p, _)| p.to_string());

        prop_assert_eq!(before, after);
    }
}
