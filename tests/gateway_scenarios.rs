//! End-to-end coverage for the §8 gateway scenarios (S1-S6), driving a real
//! `axum::Router` assembled with the same filter layering as `main.rs`
//! through `tower::ServiceExt::oneshot` rather than a bound TCP listener.
//! The only fake collaborators are an in-process "upstream" axum server
//! (avoids a mocking crate, same no-mocking convention as the teacher's
//! Postgres-backed integration tests) and the crate's own
//! `cache_store::testing::FakeCacheStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use gateway_server::cache_store::testing::FakeCacheStore;
use gateway_server::cache_store::CacheStore;
use gateway_server::ccu::{CcuTracker, DashboardMetricsSink};
use gateway_server::config::{Config, UpstreamSection};
use gateway_server::error::GatewayError;
use gateway_server::filters::{authorization, csrf, enrichment, metrics_filter, rate_limit, tracing_filter};
use gateway_server::metrics::MetricsRecorder;
use gateway_server::oidc::OidcClient;
use gateway_server::permission::{IdentityRpc, PermissionResolver};
use gateway_server::policy::PolicyManager;
use gateway_server::rate_limit::RateLimitEngine;
use gateway_server::resilience::circuit_breaker::CircuitBreakerConfig;
use gateway_server::resilience::RetryPolicy;
use gateway_server::router::{resolve_route, ForwardRequest, ServiceResilienceConfig, StaticServiceDiscovery, UpstreamClient};
use gateway_server::session::SessionStore;
use gateway_server::state::AppState;

fn metrics_recorder() -> Arc<MetricsRecorder> {
    static ONCE: OnceLock<Arc<MetricsRecorder>> = OnceLock::new();
    ONCE.get_or_init(|| Arc::new(MetricsRecorder::install().expect("install prometheus recorder once")))
        .clone()
}

fn write_policy_fixture(contents: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("gateway_scenarios_policy_{}_{n}.toml", std::process::id()));
    std::fs::write(&path, contents).expect("write policy fixture");
    path.to_string_lossy().to_string()
}

/// Grants `product:read` and nothing else, standing in for the identity
/// service's permission RPC.
#[derive(Default)]
struct GrantProductRead;

#[async_trait]
impl IdentityRpc for GrantProductRead {
    async fn check_permission(&self, _user_id: &str, code: &str) -> Result<bool, GatewayError> {
        Ok(code == "product:read")
    }

    async fn list_roles(&self, _user_id: &str) -> Result<Vec<String>, GatewayError> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Default)]
struct FakeUpstreamState {
    total: Arc<AtomicUsize>,
}

async fn fake_products(State(state): State<FakeUpstreamState>, headers: HeaderMap) -> axum::Json<serde_json::Value> {
    state.total.fetch_add(1, Ordering::SeqCst);
    axum::Json(serde_json::json!({
        "authorization": headers.get("authorization").and_then(|v| v.to_str().ok()),
        "x_authz_perm": headers.get("x-authz-perm").and_then(|v| v.to_str().ok()),
    }))
}

async fn fake_always_fail(State(state): State<FakeUpstreamState>) -> StatusCode {
    state.total.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Binds a throwaway axum server standing in for a real upstream instance,
/// the same "spin up a real in-process collaborator instead of mocking the
/// trait" approach the cache store and identity RPC fakes use.
async fn spawn_fake_upstream() -> (String, FakeUpstreamState) {
    let state = FakeUpstreamState::default();
    let app = Router::new()
        .route("/products/{id}", get(fake_products))
        .route("/always-fail", get(fake_always_fail))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

struct TestHarness {
    state: AppState,
    fake_cache: Arc<FakeCacheStore>,
}

fn build_config(upstream_base: Option<&str>) -> Config {
    let mut upstream = HashMap::new();
    if let Some(base) = upstream_base {
        upstream.insert(
            "business-service".to_string(),
            UpstreamSection {
                instances: vec![base.to_string()],
                connect_timeout_ms: 200,
                read_timeout_ms: 2_000,
                write_timeout_ms: 2_000,
                max_connections: 10,
                strip_prefix_count: 1,
            },
        );
    }
    Config { upstream, ..Config::default() }
}

/// Assembles a full `AppState` the way `main.rs` does, minus OIDC/identity
/// HTTP wiring (the `IdentityRpc` fake stands in directly, so no real
/// `identity-service` upstream is needed for these scenarios).
async fn build_harness(upstream_base: Option<String>, policy_toml: &str, breaker: Option<CircuitBreakerConfig>) -> TestHarness {
    let config = Arc::new(build_config(upstream_base.as_deref()));
    let cache_deadline = Duration::from_millis(500);

    let fake_cache = Arc::new(FakeCacheStore::default());
    let cache_store: Arc<dyn CacheStore> = fake_cache.clone();

    let session_store = Arc::new(SessionStore::new(cache_store.clone(), cache_deadline, 1_000, Duration::from_secs(60)));

    let policy_path = write_policy_fixture(policy_toml);
    let policy_manager = Arc::new(PolicyManager::new(policy_path));
    policy_manager.reload().await.expect("policy fixture should parse");

    let rate_limit_engine = Arc::new(RateLimitEngine::new(cache_store.clone(), cache_deadline));
    let permission_resolver = Arc::new(PermissionResolver::new(cache_store.clone(), Arc::new(GrantProductRead), cache_deadline));

    let discovery = Arc::new(StaticServiceDiscovery::from_config(&config.upstream));
    let mut resilience_config = HashMap::new();
    if let Some(upstream) = config.upstream.get("business-service") {
        resilience_config.insert(
            "business-service".to_string(),
            ServiceResilienceConfig {
                max_concurrent: 100,
                bulkhead_acquire_timeout: Duration::from_millis(100),
                connect_timeout: upstream.connect_timeout(),
                breaker: breaker.unwrap_or_default(),
                retry: RetryPolicy::default(),
            },
        );
    }
    let upstream_client = Arc::new(UpstreamClient::new(discovery, resilience_config).unwrap());

    let ccu = Arc::new(CcuTracker::new(cache_store.clone(), cache_deadline, Duration::from_secs(120)));
    let dashboard = Arc::new(DashboardMetricsSink::new(cache_store.clone(), cache_deadline));
    let oidc = Arc::new(OidcClient::new(config.oidc.clone()));
    let metrics = metrics_recorder();

    let state = AppState {
        config,
        cache_store,
        session_store,
        permission_resolver,
        policy_manager,
        rate_limit_engine,
        upstream_client,
        ccu,
        dashboard,
        oidc,
        metrics,
    };

    TestHarness { state, fake_cache }
}

async fn create_test_session(state: &AppState, user_id: &str) -> String {
    state
        .session_store
        .create(user_id, user_id, "access-token", "refresh-token", Duration::from_secs(3_600), Duration::from_secs(86_400), HashMap::new())
        .await
        .expect("session should persist")
}

/// Reimplements `main.rs::proxy` against only public crate APIs (the real
/// handler is private to the binary crate).
async fn test_proxy(State(state): State<AppState>, OriginalUri(uri): OriginalUri, method: Method, headers: HeaderMap, body: axum::body::Bytes) -> axum::response::Response {
    let path = uri.path();
    let Some((service, forward_path)) = resolve_route(path, &state.config.upstream) else {
        return GatewayError::BadRequest(format!("no route for {path}")).into_response();
    };
    let upstream_config = state.config.upstream.get(&service).cloned().unwrap_or_default();
    let request = ForwardRequest { service, method, path: forward_path, headers, body };
    match state.upstream_client.forward(request, upstream_config.read_timeout()).await {
        Ok(response) => {
            let mut builder = axum::http::Response::builder().status(response.status);
            for (name, value) in response.headers.iter() {
                builder = builder.header(name.clone(), value.clone());
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|_| GatewayError::Internal("failed to build upstream response".into()).into_response())
        }
        Err(err) => err.into_response(),
    }
}

async fn ping_ok() -> StatusCode {
    StatusCode::OK
}

/// Replicates `main.rs`'s exact filter order: `.layer()` applies
/// outermost-last, so this list is the reverse of the documented chain.
fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/public/ping", get(ping_ok))
        .route("/auth/session", post(gateway_server::auth::create_session))
        .route("/{*rest}", any(test_proxy))
        .layer(axum::middleware::from_fn_with_state(state.clone(), authorization::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), enrichment::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit::layer))
        .layer(axum::middleware::from_fn(csrf::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), metrics_filter::layer))
        .layer(axum::middleware::from_fn(tracing_filter::layer))
        .with_state(state)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

const PRODUCTS_READ_POLICY: &str = r#"
[[policy]]
id = "products-read"
http_method = "GET"
path_pattern = "/business-service/products/**"
permission_code = "product:read"
is_public = false
priority = 10
"#;

#[tokio::test]
async fn s1_authorized_read_reaches_upstream_and_propagates_headers() {
    let (upstream_url, upstream_state) = spawn_fake_upstream().await;
    let harness = build_harness(Some(upstream_url), PRODUCTS_READ_POLICY, None).await;
    let session_id = create_test_session(&harness.state, "u1").await;
    let app = build_app(harness.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/business-service/products/123")
        .header("cookie", format!("SESSION_ID={session_id}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["authorization"], "Bearer access-token");
    assert_eq!(body["x_authz_perm"], "product:read");
    assert_eq!(upstream_state.total.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.fake_cache.data.lock().get("online:u1").cloned(), Some("1".to_string()));
}

#[tokio::test]
async fn s2_missing_csrf_header_on_mutating_request_is_rejected() {
    let (upstream_url, upstream_state) = spawn_fake_upstream().await;
    let policy = r#"
[[policy]]
id = "products-write"
http_method = "POST"
path_pattern = "/business-service/products/**"
permission_code = "product:write"
is_public = false
priority = 10
"#;
    let harness = build_harness(Some(upstream_url), policy, None).await;
    let session_id = create_test_session(&harness.state, "u1").await;
    let app = build_app(harness.state.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/business-service/products")
        .header("cookie", format!("SESSION_ID={session_id}"))
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "CSRF_PROTECTION");
    assert_eq!(upstream_state.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s3_101st_anonymous_request_in_a_window_is_rate_limited() {
    let harness = build_harness(None, "", None).await;
    let app = build_app(harness.state.clone());

    for i in 0..101 {
        let request = Request::builder()
            .method("GET")
            .uri("/public/ping")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        if i < 100 {
            assert_eq!(response.status(), StatusCode::OK, "request {i} should be admitted");
        } else {
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            let remaining = response.headers().get("x-ratelimit-remaining").and_then(|v| v.to_str().ok()).map(str::to_string);
            assert_eq!(remaining.as_deref(), Some("0"));
            let body = json_body(response).await;
            assert_eq!(body["error"], "RATE_LIMITED");
        }
    }
}

#[tokio::test]
async fn s4_unknown_session_cookie_is_unauthorized() {
    let (upstream_url, upstream_state) = spawn_fake_upstream().await;
    let harness = build_harness(Some(upstream_url), PRODUCTS_READ_POLICY, None).await;
    let app = build_app(harness.state.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/business-service/products/123")
        .header("cookie", "SESSION_ID=does-not-exist")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "UNAUTHORIZED");
    assert_eq!(upstream_state.total.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s5_repeated_upstream_failures_trip_the_circuit_breaker() {
    let (upstream_url, upstream_state) = spawn_fake_upstream().await;
    let policy = r#"
[[policy]]
id = "always-fail-public"
http_method = "*"
path_pattern = "/business-service/always-fail"
permission_code = ""
is_public = true
priority = 10
"#;
    let breaker = CircuitBreakerConfig {
        failure_rate_pct: 50.0,
        slow_call_ms: 2_000,
        wait_duration: Duration::from_secs(30),
        permitted_half_open: 5,
        sliding_window_size: 10,
        minimum_number_of_calls: 10,
    };
    let harness = build_harness(Some(upstream_url), policy, Some(breaker)).await;
    let app = build_app(harness.state.clone());

    let mut last_response = None;
    for _ in 0..11 {
        let request = Request::builder().method("GET").uri("/business-service/always-fail").body(Body::empty()).unwrap();
        last_response = Some(app.clone().oneshot(request).await.unwrap());
    }
    let last_response = last_response.unwrap();
    assert_eq!(last_response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(last_response).await;
    assert_eq!(body["error"], "CIRCUIT_OPEN");
    // The breaker trips after the 10th failure; the 11th attempt is
    // rejected before ever dialing the upstream.
    assert_eq!(upstream_state.total.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn s6_cache_outage_fails_closed_on_login() {
    let harness = build_harness(None, "", None).await;
    harness.fake_cache.unavailable.store(true, Ordering::SeqCst);
    let app = build_app(harness.state.clone());

    let payload = serde_json::json!({
        "access_token": "token-abc",
        "refresh_token": "refresh-abc",
        "expires_in": 3600,
    });
    let request = Request::builder()
        .method("POST")
        .uri("/auth/session")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get("set-cookie").is_none());
    let body = json_body(response).await;
    assert_eq!(body["error"], "SESSION_PERSIST_ERROR");
    assert!(harness.fake_cache.data.lock().keys().all(|k| !k.starts_with("session:")));
}
