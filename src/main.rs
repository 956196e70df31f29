use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_server::cache_store::RedisCacheStore;
use gateway_server::ccu::{CcuTracker, DashboardMetricsSink};
use gateway_server::config::Config;
use gateway_server::error::GatewayError;
use gateway_server::filters::{authorization, csrf, enrichment, metrics_filter, rate_limit, tracing_filter};
use gateway_server::identity_client::IdentityServiceClient;
use gateway_server::metrics::{metrics_handler, MetricsRecorder};
use gateway_server::oidc::OidcClient;
use gateway_server::permission::PermissionResolver;
use gateway_server::policy::PolicyManager;
use gateway_server::rate_limit::RateLimitEngine;
use gateway_server::router::{resolve_route, ForwardRequest, ServiceResilienceConfig, StaticServiceDiscovery, UpstreamClient};
use gateway_server::session::SessionStore;
use gateway_server::state::AppState;
use gateway_server::{auth, health};

/// The catch-all route: every request that survived the filter chain lands
/// here. Resolves the path's leading segment to an upstream service (spec §3
/// Route Descriptor) and forwards it through the Upstream Client. Grounded
/// in the teacher's `xrpc_proxy::proxy` handler, generalized from a single
/// fixed base URL to the multi-instance, resilience-wrapped Router.
async fn proxy(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
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
            builder.body(axum::body::Body::from(response.body)).unwrap_or_else(|_| {
                GatewayError::Internal("failed to build upstream response".into()).into_response()
            })
        }
        Err(err) => err.into_response(),
    }
}

fn enabled(var: &str) -> bool {
    matches!(std::env::var(var).as_deref(), Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting API gateway");

    let config_path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_string());
    let config = Arc::new(Config::load(&config_path)?);
    tracing::info!(path = %config_path, "configuration loaded");

    let metrics = Arc::new(MetricsRecorder::install()?);
    tracing::info!("metrics recorder installed");

    let cache_store: Arc<dyn gateway_server::cache_store::CacheStore> = Arc::new(
        RedisCacheStore::connect(&config.cache_store.addr, config.cache_store.password.as_deref()).await?,
    );
    tracing::info!("cache store connected");

    let cache_deadline = Duration::from_millis(config.cache_store.timeout_ms);

    let session_store = Arc::new(SessionStore::new(
        cache_store.clone(),
        cache_deadline,
        config.session.l1_max,
        Duration::from_millis(config.session.l1_ttl_ms),
    ));

    let discovery = Arc::new(StaticServiceDiscovery::from_config(&config.upstream));
    let resilience_config: HashMap<String, ServiceResilienceConfig> = config
        .upstream
        .keys()
        .map(|name| {
            let breaker = config.breaker_for(name);
            let retry = config.retry_for(name);
            let upstream = config.upstream.get(name).cloned().unwrap_or_default();
            let cfg = ServiceResilienceConfig {
                max_concurrent: 100,
                bulkhead_acquire_timeout: Duration::from_millis(100),
                connect_timeout: upstream.connect_timeout(),
                breaker: gateway_server::resilience::circuit_breaker::CircuitBreakerConfig {
                    failure_rate_pct: breaker.failure_rate_pct,
                    slow_call_ms: breaker.slow_call_ms,
                    wait_duration: Duration::from_secs(breaker.wait_duration_s),
                    permitted_half_open: breaker.permitted_half_open,
                    sliding_window_size: breaker.sliding_window_size,
                    minimum_number_of_calls: breaker.minimum_number_of_calls,
                },
                retry: gateway_server::resilience::RetryPolicy {
                    max_attempts: retry.max_attempts,
                    base_interval: Duration::from_millis(retry.interval_ms),
                    multiplier: retry.multiplier,
                },
            };
            (name.clone(), cfg)
        })
        .collect();
    let upstream_client = Arc::new(UpstreamClient::new(discovery, resilience_config)?);
    tracing::info!(services = config.upstream.len(), "upstream client initialized");

    let identity_client = Arc::new(IdentityServiceClient::new(upstream_client.clone(), Duration::from_secs(10)));
    let permission_resolver = Arc::new(PermissionResolver::new(cache_store.clone(), identity_client, cache_deadline));

    let policy_manager = Arc::new(PolicyManager::new(config.policy.source_path.clone()));
    if let Err(err) = policy_manager.reload().await {
        tracing::warn!(error = %err, "initial policy load failed, starting with an empty policy set");
    }
    policy_manager.clone().spawn_refresh_task(Duration::from_secs(config.policy.refresh_interval_s));

    let rate_limit_engine = Arc::new(RateLimitEngine::new(cache_store.clone(), cache_deadline));

    let ccu = Arc::new(CcuTracker::new(
        cache_store.clone(),
        cache_deadline,
        Duration::from_secs(config.ccu.online_ttl_minutes * 60),
    ));
    ccu.clone().spawn_scanner(Duration::from_secs(config.ccu.scan_interval_s));

    let dashboard = Arc::new(DashboardMetricsSink::new(cache_store.clone(), cache_deadline));
    let oidc = Arc::new(OidcClient::new(config.oidc.clone()));

    let state = AppState {
        config: config.clone(),
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

    let mut app = Router::new()
        .route("/actuator/health", get(health::health))
        .route("/actuator/health/liveness", get(health::liveness))
        .route("/actuator/health/readiness", get(health::readiness))
        .route("/oauth2/authorization/{provider}", get(auth::start_login))
        .route("/login/oauth2/code/{provider}", get(auth::callback))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/session", get(auth::whoami).post(auth::create_session))
        .route("/{*rest}", any(proxy));

    if enabled("ENABLE_METRICS") {
        app = app.route("/actuator/metrics", get(metrics_handler));
        tracing::info!("prometheus /actuator/metrics exposed");
    }

    // Filters are layered innermost-first (spec §4.6): Authorization runs
    // closest to the handler, Tracing wraps everything. `.layer()` applies
    // outermost-last in axum/tower, so the order here is the reverse of the
    // documented filter-chain table.
    let app = app
        .layer(axum::middleware::from_fn_with_state(state.clone(), authorization::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), enrichment::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit::layer))
        .layer(axum::middleware::from_fn(csrf::layer))
        .layer(axum::middleware::from_fn_with_state(state.clone(), metrics_filter::layer))
        .layer(axum::middleware::from_fn(tracing_filter::layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.gateway.listen_addr.parse()?;
    tracing::info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}
