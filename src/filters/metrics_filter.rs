//! Metrics filter (spec §4.6, order −90): records start time, increments an
//! in-process request counter, and on completion records duration and
//! error-class — both as Prometheus series (teacher's `metrics.rs` shape)
//! and as the cache-store dashboard batch (spec §4.8) via
//! [`crate::ccu::DashboardMetricsSink`]. Runs before CSRF so CSRF-rejected
//! calls are still counted (spec §4.6 ordering rationale). Never
//! short-circuits; metrics failures are swallowed inside the sink itself
//! (fail-open, spec §7).

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::state::AppState;

pub async fn layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    metrics::counter!("http_requests_total", "method" => method.clone()).increment(1);

    let response = next.run(request).await;

    let duration = start.elapsed();
    let is_error = response.status().is_client_error() || response.status().is_server_error();

    metrics::histogram!("http_request_duration_seconds", "method" => method.clone()).record(duration.as_secs_f64());
    if is_error {
        metrics::counter!("http_request_errors_total", "method" => method.clone()).increment(1);
    }

    state.dashboard.record_request(&method, &path, is_error, duration).await;

    response
}
