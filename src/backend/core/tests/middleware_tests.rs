//! End-to-end tests for the rate limiting middleware and admin router.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Path},
    http::{header::RETRY_AFTER, Request, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use limiter_core::admin;
use limiter_core::clock::ManualClock;
use limiter_core::config::{RateLimitConfig, TenantLimits};
use limiter_core::manager::RateLimitManager;
use limiter_core::middleware::{RateLimitLayer, RateLimiter};
use limiter_core::storage::{Precondition, StorageBackend, StoredValue};
use limiter_core::strategy::StrategyKind;
use limiter_core::{RateLimitError, Result};

// ============================================================================
// Test Utilities
// ============================================================================

/// Storage that is permanently down.
struct FailingStorage;

#[async_trait]
impl StorageBackend for FailingStorage {
    async fn increment(&self, _key: &str, _expire: u64, _amount: i64) -> Result<(i64, u64)> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn increment_and_get(
        &self,
        _key: &str,
        _expire: u64,
        _amount: i64,
        _others: &[&str],
    ) -> Result<((i64, u64), HashMap<String, StoredValue>)> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn get(&self, _key: &str) -> Result<StoredValue> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn set(&self, _key: &str, _value: f64, _expire: u64) -> Result<bool> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn reset(&self, _key: &str) -> Result<bool> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn get_many(&self, _keys: &[&str]) -> Result<HashMap<String, StoredValue>> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn set_many(
        &self,
        _values: &[(String, f64)],
        _expire: u64,
        _preconditions: &[Precondition],
    ) -> Result<bool> {
        Err(RateLimitError::storage("connection refused"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

fn manager(config: RateLimitConfig) -> RateLimitManager {
    RateLimitManager::with_clock(config, Arc::new(ManualClock::new(6000.0))).unwrap()
}

fn limiter(config: RateLimitConfig) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(Arc::new(manager(config))).unwrap())
}

fn failing_limiter(config: RateLimitConfig) -> Arc<RateLimiter> {
    let manager = manager(config).with_storage(Arc::new(FailingStorage));
    Arc::new(RateLimiter::new(Arc::new(manager)).unwrap())
}

fn app(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/api/items", get(|| async { "items" }))
        .route("/api/v1/x", get(|| async { "x" }))
        .route(
            "/tenants/:tenant_id/items",
            get(|Path(tenant): Path<String>| async move { tenant }),
        )
        .route("/health", get(|| async { "ok" }))
        .route(
            "/api/busy",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, [(RETRY_AFTER, "120")]) }),
        )
        .layer(RateLimitLayer::new(limiter))
}

fn request(uri: &str, ip: &str) -> Request<Body> {
    let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let addr: SocketAddr = format!("{}:40000", ip).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn with_header(mut request: Request<Body>, name: &'static str, value: &str) -> Request<Body> {
    request.headers_mut().insert(name, value.parse().unwrap());
    request
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Admission and Headers
// ============================================================================

#[tokio::test]
async fn test_allowed_responses_carry_headers() {
    let app = app(limiter(RateLimitConfig::builder().rate_limit(3).build()));

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "X-RateLimit-Limit").as_deref(), Some("3"));
    assert_eq!(header(&response, "X-RateLimit-Remaining").as_deref(), Some("2"));
    // 6000 is a window boundary
    assert_eq!(header(&response, "X-RateLimit-Reset").as_deref(), Some("60"));
    assert!(header(&response, "Retry-After").is_none());
}

#[tokio::test]
async fn test_rejection_is_structured_429() {
    let app = app(limiter(RateLimitConfig::builder().rate_limit(2).build()));

    for _ in 0..2 {
        let response = send(&app, request("/api/items", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "X-RateLimit-Remaining").as_deref(), Some("0"));
    assert_eq!(header(&response, "Retry-After").as_deref(), Some("60"));

    let body = json_body(response).await;
    assert_eq!(body["limit"], 2);
    assert_eq!(body["reset"], 60);
    assert_eq!(body["retry_after"], 60);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_include_headers_false_suppresses_headers() {
    let config = RateLimitConfig::builder()
        .rate_limit(1)
        .include_headers(false)
        .build();
    let app = app(limiter(config));

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "X-RateLimit-Limit").is_none());

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(header(&response, "X-RateLimit-Remaining").is_none());
    assert!(header(&response, "Retry-After").is_none());
}

#[tokio::test]
async fn test_downstream_retry_after_survives() {
    for include_headers in [false, true] {
        let config = RateLimitConfig::builder()
            .rate_limit(5)
            .include_headers(include_headers)
            .build();
        let app = app(limiter(config));

        let response = send(&app, request("/api/busy", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header(&response, "Retry-After").as_deref(), Some("120"));
        assert_eq!(
            header(&response, "X-RateLimit-Limit").is_some(),
            include_headers
        );
    }
}

#[tokio::test]
async fn test_custom_header_prefix() {
    let config = RateLimitConfig::builder().header_prefix("X-Quota").build();
    let app = app(limiter(config));

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(header(&response, "X-Quota-Limit").as_deref(), Some("100"));
    assert!(header(&response, "X-RateLimit-Limit").is_none());
}

#[tokio::test]
async fn test_disabled_limiter_passes_everything() {
    let config = RateLimitConfig::builder().enabled(false).rate_limit(1).build();
    let app = app(limiter(config));

    for _ in 0..5 {
        let response = send(&app, request("/api/items", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "X-RateLimit-Limit").is_none());
    }
}

#[tokio::test]
async fn test_forwarded_client_ip_is_the_key() {
    let app = app(limiter(RateLimitConfig::builder().rate_limit(1).build()));

    // Same socket address, different forwarded clients
    let first = with_header(request("/api/items", "10.9.9.9"), "X-Forwarded-For", "198.51.100.1");
    let second = with_header(request("/api/items", "10.9.9.9"), "X-Forwarded-For", "198.51.100.2");
    assert_eq!(send(&app, first).await.status(), StatusCode::OK);
    assert_eq!(send(&app, second).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_long_keys_are_hashed_consistently() {
    let config = RateLimitConfig::builder()
        .rate_limit(1)
        .key_by(true, true, false)
        .max_key_length(40)
        .build();
    let limiter = limiter(config);
    let app = app(limiter.clone());

    let uri = format!("/tenants/{}/items", "t".repeat(80));
    assert_eq!(send(&app, request(&uri, "1.2.3.4")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, request(&uri, "1.2.3.4")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let snapshot = limiter.metrics();
    assert_eq!(snapshot.total_requests, 2);
    assert_eq!(snapshot.top_limited_identifiers.len(), 1);
    assert!(snapshot.top_limited_identifiers[0].0.len() <= 40);
}

// ============================================================================
// Exemptions
// ============================================================================

#[tokio::test]
async fn test_exact_and_wildcard_path_exemptions() {
    let config = RateLimitConfig::builder()
        .rate_limit(1)
        .exempt_path("/health")
        .exempt_path("/api/*")
        .build();
    let limiter = limiter(config);
    let app = app(limiter.clone());

    for _ in 0..5 {
        assert_eq!(send(&app, request("/health", "1.2.3.4")).await.status(), StatusCode::OK);
        assert_eq!(send(&app, request("/api/items", "1.2.3.4")).await.status(), StatusCode::OK);
    }
    // Nothing was counted
    assert_eq!(limiter.metrics().total_requests, 0);

    let tenant = request("/tenants/acme/items", "1.2.3.4");
    assert_eq!(send(&app, tenant).await.status(), StatusCode::OK);
    let tenant = request("/tenants/acme/items", "1.2.3.4");
    assert_eq!(send(&app, tenant).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_cidr_ip_exemption() {
    let config = RateLimitConfig::builder()
        .rate_limit(1)
        .exempt_ip("10.0.0.0/8")
        .build();
    let app = app(limiter(config));

    for _ in 0..5 {
        let response = send(&app, request("/api/v1/x", "10.1.2.3")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "X-RateLimit-Limit").is_none());
    }

    assert_eq!(send(&app, request("/api/v1/x", "11.1.2.3")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, request("/api/v1/x", "11.1.2.3")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

// ============================================================================
// Tenants
// ============================================================================

#[tokio::test]
async fn test_tenants_do_not_share_counters() {
    let config = RateLimitConfig::builder()
        .rate_limit(5)
        .tenant_limits(
            "a",
            TenantLimits {
                rate_limit: Some(2),
                ..Default::default()
            },
        )
        .tenant_limits(
            "b",
            TenantLimits {
                rate_limit: Some(3),
                ..Default::default()
            },
        )
        .build();
    let app = app(limiter(config));

    for _ in 0..2 {
        let response = send(&app, with_header(request("/api/items", "1.2.3.4"), "X-Tenant-ID", "a")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&app, with_header(request("/api/items", "1.2.3.4"), "X-Tenant-ID", "a")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = send(&app, with_header(request("/api/items", "1.2.3.4"), "X-Tenant-ID", "b")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "X-RateLimit-Limit").as_deref(), Some("3"));
    assert_eq!(header(&response, "X-RateLimit-Remaining").as_deref(), Some("2"));
}

#[tokio::test]
async fn test_tenant_from_query_and_path() {
    let config = RateLimitConfig::builder()
        .rate_limit(5)
        .tenant_limits(
            "acme",
            TenantLimits {
                rate_limit: Some(1),
                ..Default::default()
            },
        )
        .build();
    let app = app(limiter(config));

    let response = send(&app, request("/api/items?tenant_id=acme", "1.2.3.4")).await;
    assert_eq!(header(&response, "X-RateLimit-Limit").as_deref(), Some("1"));

    // Path parameter resolves to the same tenant and counter
    let response = send(&app, request("/tenants/acme/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Unknown tenants get the global default
    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(header(&response, "X-RateLimit-Limit").as_deref(), Some("5"));
}

#[tokio::test]
async fn test_live_tenant_override() {
    let limiter = limiter(
        RateLimitConfig::builder()
            .rate_limit(5)
            .enable_tenant_limits(true)
            .build(),
    );
    let app = app(limiter.clone());

    limiter
        .tenants()
        .set_tenant_limits(
            "late",
            TenantLimits {
                rate_limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

    let late = || with_header(request("/api/items", "1.2.3.4"), "X-Tenant-ID", "late");
    assert_eq!(send(&app, late()).await.status(), StatusCode::OK);
    assert_eq!(send(&app, late()).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ============================================================================
// Storage Failures
// ============================================================================

#[tokio::test]
async fn test_storage_outage_fails_open() {
    let app = app(failing_limiter(RateLimitConfig::default()));

    for _ in 0..3 {
        let response = send(&app, request("/api/items", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "X-RateLimit-Limit").is_none());
        assert!(header(&response, "X-RateLimit-Remaining").is_none());
    }
}

#[tokio::test]
async fn test_storage_outage_fails_open_for_every_strategy() {
    for kind in [StrategyKind::SlidingWindow, StrategyKind::TokenBucket] {
        let app = app(failing_limiter(RateLimitConfig::builder().strategy(kind).build()));
        let response = send(&app, request("/api/items", "1.2.3.4")).await;
        assert_eq!(response.status(), StatusCode::OK, "{}", kind);
    }
}

#[tokio::test]
async fn test_block_on_failure_returns_generic_500() {
    let config = RateLimitConfig::builder().block_on_failure(true).build();
    let app = app(failing_limiter(config));

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["detail"], "An internal error occurred");
}

// ============================================================================
// Admin Router
// ============================================================================

#[tokio::test]
async fn test_admin_inspect_and_reset_key() {
    let limiter = limiter(RateLimitConfig::builder().rate_limit(2).build());
    let app = app(limiter.clone());
    let admin = admin::router(limiter.clone());

    send(&app, request("/api/items", "1.2.3.4")).await;
    send(&app, request("/api/items", "1.2.3.4")).await;

    let response = send(&admin, Request::get("/ratelimit/keys/1.2.3.4").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["remaining"], 0);

    let response = send(&admin, Request::delete("/ratelimit/keys/1.2.3.4").body(Body::empty()).unwrap()).await;
    assert_eq!(json_body(response).await["reset"], true);

    let response = send(&app, request("/api/items", "1.2.3.4")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_metrics_and_reset() {
    let limiter = limiter(RateLimitConfig::builder().rate_limit(1).build());
    let app = app(limiter.clone());
    let admin = admin::router(limiter.clone());

    send(&app, request("/api/items", "1.2.3.4")).await;
    send(&app, request("/api/items", "1.2.3.4")).await;

    let response = send(&admin, Request::get("/ratelimit/metrics").body(Body::empty()).unwrap()).await;
    let body = json_body(response).await;
    assert_eq!(body["total_requests"], 2);
    assert_eq!(body["limited_requests"], 1);
    assert_eq!(body["by_strategy"]["fixed_window"]["limited"], 1);

    let response = send(&admin, Request::post("/ratelimit/metrics/reset").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(limiter.metrics().total_requests, 0);
}

#[tokio::test]
async fn test_admin_surfaces_storage_errors_generically() {
    let admin = admin::router(failing_limiter(RateLimitConfig::default()));
    let response = send(&admin, Request::get("/ratelimit/keys/anyone").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
