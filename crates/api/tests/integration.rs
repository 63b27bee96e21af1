//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to drive the router without a real HTTP server.
//! All backends are in memory, so these run without Postgres or Redis.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use herald_api::middleware::auth::{AuthValidator, LocalJwtValidator, encode_jwt};
use herald_api::middleware::rate_limit::REMAINING_HEADER;
use herald_api::routes::create_router;
use herald_api::state::{AppState, Backends};
use herald_common::clock::SystemClock;
use herald_common::config::{AppConfig, AuthMode, RateLimitKey};
use herald_common::error::AppError;
use herald_common::types::{AttemptOutcome, Principal};
use herald_engine::rate_limit::InMemoryBucketStore;
use herald_engine::{InMemoryDeliveryQueue, InMemoryNotificationStore};

// ============================================================
// Helpers
// ============================================================

const TEST_SECRET: &str = "test-jwt-secret-for-integration-tests";

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "unused".to_string(),
        redis_url: "redis://unused".to_string(),
        db_max_connections: 5,
        api_bind_addr: "127.0.0.1:0".to_string(),
        auth_mode: AuthMode::Local,
        jwt_secret: TEST_SECRET.to_string(),
        auth_introspection_url: None,
        resend_api_key: None,
        email_from: None,
        worker_concurrency: 1,
        worker_lease_seconds: 60,
        worker_poll_wait_ms: 100,
        emitter_timeout_seconds: 30,
        max_attempts: 3,
        retry_base_delay_seconds: 300,
        retry_jitter: false,
        rate_limit_capacity: 10,
        rate_limit_refill_per_minute: 10.0,
        rate_limit_key: RateLimitKey::Ip,
        rate_limit_bucket_ttl_seconds: 120,
        health_cache_ttl_ms: 0,
        health_reconnect_interval_ms: 10,
    }
}

struct TestApp {
    state: AppState,
    store: Arc<InMemoryNotificationStore>,
    queue: Arc<InMemoryDeliveryQueue>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: AppConfig) -> Self {
        Self::with_auth(config, Arc::new(LocalJwtValidator::new(TEST_SECRET)))
    }

    fn with_auth(config: AppConfig, auth: Arc<dyn AuthValidator>) -> Self {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(InMemoryNotificationStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new(clock.clone()));
        let backends = Backends {
            store: store.clone(),
            queue: queue.clone(),
            buckets: Arc::new(InMemoryBucketStore::new()),
            clock,
        };
        let state = AppState::new(&config, backends, auth).unwrap();
        Self {
            state,
            store,
            queue,
        }
    }

    fn router(&self) -> Router {
        create_router(self.state.clone())
    }
}

fn token(subject: &str, roles: &[&str]) -> String {
    let principal = Principal {
        subject: subject.to_string(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
    };
    encode_jwt(&principal, TEST_SECRET, 1).unwrap()
}

fn user_token() -> String {
    token("user-1", &[])
}

fn admin_token() -> String {
    token("ops-1", &["admin"])
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn email_request(recipient: &str) -> Value {
    json!({
        "channel_type": "EMAIL",
        "recipient": recipient,
        "payload": {"subject": "Welcome", "body": "Hello there"}
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn create_email(app: &TestApp, recipient: &str) -> Value {
    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request(recipient)),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

/// Drive a freshly created notification straight to FAILED.
async fn fail(app: &TestApp, id: &str) {
    let id = id.parse().unwrap();
    app.state
        .service
        .record_attempt_result(id, 0, AttemptOutcome::PermanentFailure("bounced".into()))
        .await
        .unwrap();
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_liveness() {
    let app = TestApp::new();
    let response = app.router().oneshot(get("/health/live", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "alive");
}

#[tokio::test]
async fn test_readiness_reports_dependencies() {
    let app = TestApp::new();
    let response = app.router().oneshot(get("/health/ready", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["ready"], true);
    assert_eq!(body["dependencies"]["database"]["healthy"], true);
    assert_eq!(body["dependencies"]["queue"]["healthy"], true);
}

#[tokio::test]
async fn test_degraded_readiness_still_answers_ok() {
    let app = TestApp::new();
    app.store.set_available(false);

    let response = app.router().oneshot(get("/health/ready", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["degraded"], true);
    assert_eq!(body["dependencies"]["database"]["healthy"], false);
    app.state.health.shutdown();
}

// ============================================================
// Notifications
// ============================================================

#[tokio::test]
async fn test_create_notification_queues_it() {
    let app = TestApp::new();
    let created = create_email(&app, "  alice@example.com ").await;

    assert_eq!(created["status"], "QUEUED");
    assert_eq!(created["recipient"], "alice@example.com");
    assert_eq!(created["attempt_count"], 0);
    assert!(created.get("version").is_none());
    assert_eq!(app.queue.pending_jobs().len(), 1);
}

#[tokio::test]
async fn test_create_rejects_invalid_recipient() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request("not-an-email")),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_create_rejects_missing_subject() {
    let app = TestApp::new();
    let body = json!({
        "channel_type": "EMAIL",
        "recipient": "alice@example.com",
        "payload": {"body": "no subject"}
    });
    let response = app
        .router()
        .oneshot(post("/api/notifications", Some(&user_token()), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_requires_token() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            None,
            Some(email_request("alice@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_jwt_rejected() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(get("/api/notifications", Some("invalid.jwt.token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_queue_outage_returns_503_and_keeps_pending() {
    let app = TestApp::new();
    app.queue.set_available(false);

    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request("alice@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.store.len(), 1);

    let list = app
        .router()
        .oneshot(get("/api/notifications?status=PENDING", Some(&user_token())))
        .await
        .unwrap();
    assert_eq!(json_body(list).await["count"], 1);
}

#[tokio::test]
async fn test_get_notification_and_not_found() {
    let app = TestApp::new();
    let created = create_email(&app, "alice@example.com").await;
    let id = created["id"].as_str().unwrap();

    let response = app
        .router()
        .oneshot(get(&format!("/api/notifications/{}", id), Some(&user_token())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["id"], id);

    let missing = app
        .router()
        .oneshot(get(
            &format!("/api/notifications/{}", uuid::Uuid::new_v4()),
            Some(&user_token()),
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_filters_and_paginates() {
    let app = TestApp::new();
    create_email(&app, "alice@example.com").await;
    create_email(&app, "bob@example.com").await;
    let failed = create_email(&app, "carol@example.com").await;
    fail(&app, failed["id"].as_str().unwrap()).await;

    let response = app
        .router()
        .oneshot(get("/api/notifications?status=QUEUED", Some(&user_token())))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["count"], 2);
    assert_eq!(body["limit"], 50);

    let response = app
        .router()
        .oneshot(get(
            "/api/notifications?recipient=carol@example.com",
            Some(&user_token()),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["status"], "FAILED");

    let response = app
        .router()
        .oneshot(get("/api/notifications?limit=2&offset=2", Some(&user_token())))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["offset"], 2);

    let response = app
        .router()
        .oneshot(get("/api/notifications?limit=0", Some(&user_token())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================
// Rate limiting
// ============================================================

#[tokio::test]
async fn test_rate_limit_rejects_after_capacity() {
    let app = TestApp::with_config(AppConfig {
        rate_limit_capacity: 3,
        rate_limit_refill_per_minute: 1.0,
        ..test_config()
    });

    for i in 0..3 {
        let response = app
            .router()
            .oneshot(post(
                "/api/notifications",
                Some(&user_token()),
                Some(email_request(&format!("user{}@example.com", i))),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[REMAINING_HEADER].to_str().unwrap(),
            (2 - i).to_string()
        );
    }

    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request("late@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(app.store.len(), 3);

    // Reads are not limited.
    let response = app
        .router()
        .oneshot(get("/api/notifications", Some(&user_token())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_buckets_are_per_client() {
    let app = TestApp::with_config(AppConfig {
        rate_limit_capacity: 1,
        rate_limit_refill_per_minute: 1.0,
        ..test_config()
    });

    let request = |ip: &str, recipient: &str| {
        Request::builder()
            .method("POST")
            .uri("/api/notifications")
            .header("x-forwarded-for", ip)
            .header(header::AUTHORIZATION, format!("Bearer {}", user_token()))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_vec(&email_request(recipient)).unwrap(),
            ))
            .unwrap()
    };

    let first = app
        .router()
        .oneshot(request("198.51.100.1", "a@example.com"))
        .await
        .unwrap();
    let second = app
        .router()
        .oneshot(request("198.51.100.2, 10.0.0.1", "b@example.com"))
        .await
        .unwrap();
    let repeat = app
        .router()
        .oneshot(request("198.51.100.1", "c@example.com"))
        .await
        .unwrap();

    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_principal_keyed_rate_limit() {
    let app = TestApp::with_config(AppConfig {
        rate_limit_capacity: 1,
        rate_limit_refill_per_minute: 1.0,
        rate_limit_key: RateLimitKey::Principal,
        ..test_config()
    });

    let alice = token("alice", &[]);
    let bob = token("bob", &[]);
    let send = |token: String, recipient: &'static str| {
        post(
            "/api/notifications",
            Some(token.as_str()),
            Some(email_request(recipient)),
        )
    };

    // Same address, different principals.
    let a = app.router().oneshot(send(alice.clone(), "a@example.com")).await.unwrap();
    let b = app.router().oneshot(send(bob, "b@example.com")).await.unwrap();
    let again = app.router().oneshot(send(alice, "c@example.com")).await.unwrap();

    assert_eq!(a.status(), StatusCode::CREATED);
    assert_eq!(b.status(), StatusCode::CREATED);
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
}

/// Local JWT validation that counts how often it runs.
struct CountingValidator {
    inner: LocalJwtValidator,
    calls: AtomicUsize,
}

#[async_trait]
impl AuthValidator for CountingValidator {
    async fn validate(&self, credential: &str) -> Result<Principal, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.validate(credential).await
    }
}

#[tokio::test]
async fn test_principal_keyed_rate_limit_validates_token_once() {
    let validator = Arc::new(CountingValidator {
        inner: LocalJwtValidator::new(TEST_SECRET),
        calls: AtomicUsize::new(0),
    });
    let app = TestApp::with_auth(
        AppConfig {
            rate_limit_key: RateLimitKey::Principal,
            ..test_config()
        },
        validator.clone(),
    );

    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request("a@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);

    let admin = app
        .router()
        .oneshot(get("/api/admin/notifications/stats", Some(&admin_token())))
        .await
        .unwrap();
    assert_eq!(admin.status(), StatusCode::OK);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 2);

    // A bad token is still refused by the handler.
    let rejected = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some("not.a.jwt"),
            Some(email_request("b@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ip_keyed_rate_limit_validates_token_in_handler() {
    let validator = Arc::new(CountingValidator {
        inner: LocalJwtValidator::new(TEST_SECRET),
        calls: AtomicUsize::new(0),
    });
    let app = TestApp::with_auth(test_config(), validator.clone());

    let response = app
        .router()
        .oneshot(post(
            "/api/notifications",
            Some(&user_token()),
            Some(email_request("a@example.com")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// Admin recovery
// ============================================================

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(post(
            "/api/admin/notifications/retry-failed",
            Some(&user_token()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .router()
        .oneshot(get("/api/admin/notifications/stats", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_bulk_retry_flow() {
    let app = TestApp::new();
    for recipient in ["a@example.com", "b@example.com", "c@example.com"] {
        let created = create_email(&app, recipient).await;
        fail(&app, created["id"].as_str().unwrap()).await;
    }

    let response = app
        .router()
        .oneshot(get(
            "/api/admin/notifications/retry-status",
            Some(&admin_token()),
        ))
        .await
        .unwrap();
    let status = json_body(response).await;
    assert_eq!(status["failed"], 3);
    assert_eq!(status["queued"], 0);
    assert_eq!(status["safe_to_retry"], true);

    let response = app
        .router()
        .oneshot(post(
            "/api/admin/notifications/retry-failed?limit=2",
            Some(&admin_token()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await;
    assert_eq!(summary["queued"], 2);
    assert_eq!(summary["errors"], 0);
    assert_eq!(summary["total_eligible"], 3);
    assert_eq!(summary["remaining"], 1);

    let response = app
        .router()
        .oneshot(post(
            "/api/admin/notifications/retry-failed",
            Some(&admin_token()),
            None,
        ))
        .await
        .unwrap();
    let summary = json_body(response).await;
    assert_eq!(summary["queued"], 1);
    assert_eq!(summary["remaining"], 0);

    let response = app
        .router()
        .oneshot(get(
            "/api/admin/notifications/retry-status",
            Some(&admin_token()),
        ))
        .await
        .unwrap();
    let status = json_body(response).await;
    assert_eq!(status["failed"], 0);
    assert_eq!(status["queued"], 3);
    assert_eq!(status["safe_to_retry"], false);
}

#[tokio::test]
async fn test_admin_single_retry() {
    let app = TestApp::new();
    let created = create_email(&app, "alice@example.com").await;
    let id = created["id"].as_str().unwrap().to_string();

    // Not failed yet.
    let response = app
        .router()
        .oneshot(post(
            &format!("/api/admin/notifications/{}/retry", id),
            Some(&admin_token()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    fail(&app, &id).await;
    let response = app
        .router()
        .oneshot(post(
            &format!("/api/admin/notifications/{}/retry", id),
            Some(&admin_token()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["attempt_count"], 0);
    assert!(body["error_message"].is_null());
}

#[tokio::test]
async fn test_admin_retry_with_queue_down_leaves_failed() {
    let app = TestApp::new();
    let created = create_email(&app, "alice@example.com").await;
    let id = created["id"].as_str().unwrap().to_string();
    fail(&app, &id).await;

    app.queue.set_available(false);
    let response = app
        .router()
        .oneshot(post(
            &format!("/api/admin/notifications/{}/retry", id),
            Some(&admin_token()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let stored = app.state.service.get(id.parse().unwrap()).await.unwrap();
    assert_eq!(stored.status.to_string(), "FAILED");
}

#[tokio::test]
async fn test_admin_stats() {
    let app = TestApp::new();
    create_email(&app, "alice@example.com").await;
    let failed = create_email(&app, "bob@example.com").await;
    fail(&app, failed["id"].as_str().unwrap()).await;

    let response = app
        .router()
        .oneshot(get("/api/admin/notifications/stats", Some(&admin_token())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = json_body(response).await;
    assert_eq!(stats["total_notifications"], 2);
    assert_eq!(stats["status_breakdown"]["failed"], 1);
    assert_eq!(stats["status_breakdown"]["queued"], 1);
}
