//! Health surface (SPEC_FULL §ambient, teacher's `health.rs` three-endpoint
//! shape): liveness is a bare process check; readiness additionally checks
//! the cache store is reachable and the policy set has loaded; health adds a
//! summary of open circuit breakers. All three are public (spec §4.6's
//! `/actuator/` and `/health/` prefixes bypass Enrichment/Authorization).

use std::collections::HashMap;
use std::time::SystemTime;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::resilience::CircuitState;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    cache_store: bool,
    policy_loaded: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: u64,
    version: &'static str,
    checks: ReadinessChecks,
    ccu_total: u64,
    circuit_breakers: HashMap<String, &'static str>,
}

fn breaker_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "CLOSED",
        CircuitState::Open => "OPEN",
        CircuitState::HalfOpen => "HALF_OPEN",
    }
}

/// `GET /actuator/health/liveness` — the process is up and scheduling tasks.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn cache_store_reachable(state: &AppState) -> bool {
    state
        .cache_store
        .get("health:ping", std::time::Duration::from_millis(500))
        .await
        .is_ok()
}

/// `GET /actuator/health/readiness` — can this instance serve traffic.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let cache_store = cache_store_reachable(&state).await;
    let policy_loaded = state.policy_manager.entry_count() > 0;
    let ready = cache_store && policy_loaded;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(ReadinessResponse { ready, checks: ReadinessChecks { cache_store, policy_loaded } }))
}

/// `GET /actuator/health` — detailed health, including the current CCU gauge.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let cache_store = cache_store_reachable(&state).await;
    let policy_loaded = state.policy_manager.entry_count() > 0;
    let healthy = cache_store && policy_loaded;
    let timestamp = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let ccu_total = state.ccu.scan_online_count().await.unwrap_or(0) as u64;
    let circuit_breakers = state
        .upstream_client
        .breaker_states()
        .into_iter()
        .map(|(name, breaker_state)| (name, breaker_label(breaker_state)))
        .collect();

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp,
            version: env!("CARGO_PKG_VERSION"),
            checks: ReadinessChecks { cache_store, policy_loaded },
            ccu_total,
            circuit_breakers,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (status, body) = liveness().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }
}
