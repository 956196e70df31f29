//! Prometheus metrics recorder (spec §4.8's "in-process gauge `ccu_total`"
//! plus per-request counters/histograms recorded by
//! [`crate::filters::metrics_filter`]). Distinct from
//! [`crate::ccu::DashboardMetricsSink`], which batches a separate set of
//! cache-store-backed counters for a product dashboard rather than an
//! ops-facing Prometheus scrape. Grounded in the teacher's `metrics.rs`
//! (`PrometheusBuilder` installed once at startup, exposed behind a gated
//! `/metrics` handler).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::GatewayError;
use crate::state::AppState;

#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::ConfigInvalid(format!("prometheus recorder: {e}")))?;
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// `GET /actuator/metrics` — gated behind `ENABLE_METRICS=true` at router
/// assembly time (spec SPEC_FULL §ambient: "a Non-goal excluding metrics
/// from policy protection never means dropping the Prometheus exposition
/// surface, only that it's reachable without going through Authorization").
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}
