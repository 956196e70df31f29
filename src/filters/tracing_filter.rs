//! Tracing filter (spec §4.6, order −100): ensures a trace id exists on
//! every request, attaches `X-Trace-Id` to both request and response, and
//! starts a root span. Never short-circuits.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

use crate::filters::RequestContext;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

pub async fn layer(mut request: Request, next: Next) -> Response {
    let header_name = HeaderName::from_static(TRACE_ID_HEADER);
    let trace_id = request
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestContext { trace_id: trace_id.clone(), user_id: None });

    let span = tracing::info_span!("request", trace_id = %trace_id, method = %request.method(), path = %request.uri().path());

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(header_name, value);
    }
    response
}
