// src/tests/middleware_tests.rs

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use crate::config::GatekeeperConfig;
use crate::gatekeeper::middleware::{protect, CallerIdentity, RejectionBody};
use crate::gatekeeper::Gatekeeper;
use crate::test_utils::{flaky_store_with_clock, memory_store_with_clock, shared};

const RULES: &str = r#"{
    "trustProxy": true,
    "whitelist": { "ips": ["127.0.0.1"] },
    "endpoints": {
        "POST /api/auth/*": {
            "algorithm": "sliding-window",
            "config": { "windowMs": 900000, "maxRequests": 2 },
            "message": "Too many login attempts"
        },
        "* /api/*": {
            "algorithm": "token-bucket",
            "config": { "capacity": 100, "refillRate": 10, "refillInterval": 1000 }
        }
    }
}"#;

fn app(gatekeeper: Gatekeeper) -> Router {
    let router = Router::new()
        .route("/api/auth/login", post(|| async { "welcome" }))
        .route("/api/items", get(|| async { "items" }))
        .route("/health", get(|| async { "ok" }));
    protect(router, Arc::new(gatekeeper))
}

fn memory_app(json: &str) -> Router {
    let (store, clock) = memory_store_with_clock();
    let gatekeeper = Gatekeeper::builder()
        .config(GatekeeperConfig::from_json(json).unwrap())
        .store(store)
        .clock(shared(&clock))
        .build()
        .unwrap();
    app(gatekeeper)
}

fn login(ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn test_allowed_response_carries_headers() {
    let app = memory_app(RULES);

    let response = app.oneshot(login("203.0.113.1")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("2"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("1"));
    assert!(header(&response, "x-ratelimit-reset").is_some());
    assert_eq!(header(&response, "retry-after"), None);
    assert_eq!(body_bytes(response).await, b"welcome");
}

#[tokio::test]
async fn test_rejection_is_429_with_json_body() {
    let app = memory_app(RULES);

    for _ in 0..2 {
        let response = app.clone().oneshot(login("203.0.113.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(login("203.0.113.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after"), Some("900"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    assert_eq!(header(&response, "x-ratelimit-limit"), Some("2"));

    let body: RejectionBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(!body.success);
    assert_eq!(body.error.code, "RATE_LIMIT_EXCEEDED");
    assert_eq!(body.error.message, "Too many login attempts");
    assert_eq!(body.error.retry_after, 900);

    // a different client is unaffected
    let other = app.oneshot(login("203.0.113.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_authenticated_callers_are_keyed_by_user() {
    let app = memory_app(RULES);
    let login_as = |user: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-forwarded-for", "203.0.113.50")
            .extension(CallerIdentity {
                user_id: Some(user.to_string()),
                tenant_id: None,
            })
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        assert_eq!(
            app.clone().oneshot(login_as("alice")).await.unwrap().status(),
            StatusCode::OK
        );
    }
    assert_eq!(
        app.clone().oneshot(login_as("alice")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    // same IP, different user
    assert_eq!(
        app.oneshot(login_as("bob")).await.unwrap().status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_whitelisted_and_unmatched_requests_have_no_headers() {
    let app = memory_app(RULES);

    for _ in 0..5 {
        let response = app.clone().oneshot(login("127.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), None);
    }

    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(header(&health, "x-ratelimit-limit"), None);
}

#[tokio::test]
async fn test_spoofed_forwarding_header_is_ignored_without_trusted_proxy() {
    let app = memory_app(&RULES.replacen(r#""trustProxy": true,"#, "", 1));
    let peer: SocketAddr = "203.0.113.80:41000".parse().unwrap();
    let spoofed_login = || {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-forwarded-for", "127.0.0.1")
            .extension(ConnectInfo(peer))
            .body(Body::empty())
            .unwrap()
    };

    // claiming the whitelisted loopback address does not bypass the limit
    for _ in 0..2 {
        let response = app.clone().oneshot(spoofed_login()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("2"));
    }
    let response = app.clone().oneshot(spoofed_login()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // rotating the header does not buy a fresh budget either
    let rotated = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("x-forwarded-for", "198.51.100.99")
        .extension(ConnectInfo(peer))
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.oneshot(rotated).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_fail_closed_rejects_with_retry_after_one() {
    let (store, clock) = flaky_store_with_clock();
    store.set_failing();
    let json = RULES.replacen("{", r#"{ "failurePolicy": "closed","#, 1);
    let gatekeeper = Gatekeeper::builder()
        .config(GatekeeperConfig::from_json(&json).unwrap())
        .store(store)
        .clock(shared(&clock))
        .build()
        .unwrap();

    let response = app(gatekeeper)
        .oneshot(Request::get("/api/items").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after"), Some("1"));
    assert_eq!(header(&response, "x-ratelimit-limit"), None);

    let body: RejectionBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body.error.retry_after, 1);
}
