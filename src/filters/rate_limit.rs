//! Rate Limit filter (spec §4.6, order −2): derives an identifier
//! (authenticated user id via a lightweight session lookup, else client IP)
//! and tier, then calls into the Rate Limit Engine. Runs before enrichment
//! so an anonymous flood (no `SESSION_ID` cookie) never touches the Session
//! Store at all (spec §4.6 ordering rationale, §9 open question 2: this
//! spec locks rate-limit at order −2, ahead of enrichment at −1).

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::filters::{extract_client_ip, extract_session_id, RequestContext};
use crate::rate_limit::Tier;
use crate::state::AppState;

async fn identify(state: &AppState, request: &Request) -> (String, Tier) {
    if let Some(session_id) = extract_session_id(request.headers()) {
        if let Ok(Some(session)) = state.session_store.lookup(&session_id).await {
            let tier = if session.metadata.get("tier").map(String::as_str) == Some("premium") {
                Tier::Premium
            } else {
                Tier::Authenticated
            };
            return (format!("user:{}", session.user_id), tier);
        }
    }
    (format!("ip:{}", extract_client_ip(request.headers())), Tier::Anonymous)
}

pub async fn layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (identifier, tier) = identify(&state, &request).await;
    let capacity = tier.capacity(&state.config.rate_limit);
    let outcome = state.rate_limit_engine.try_consume(&identifier, tier, capacity).await;

    if !outcome.admitted {
        let trace_id = request
            .extensions()
            .get::<RequestContext>()
            .map(|ctx| ctx.trace_id.clone())
            .unwrap_or_default();
        let retry_after_s = outcome.reset_after.as_secs().max(1);
        let mut response = GatewayError::RateLimited { retry_after_s }
            .into_response_with_trace(trace_id)
            .into_response();
        apply_rate_limit_headers(&mut response, outcome.limit, outcome.remaining, outcome.reset_after.as_secs());
        if let Ok(v) = HeaderValue::from_str(&retry_after_s.to_string()) {
            response.headers_mut().insert("x-ratelimit-retry-after", v);
        }
        return response;
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(&mut response, outcome.limit, outcome.remaining, outcome.reset_after.as_secs());
    response
}

fn apply_rate_limit_headers(response: &mut Response, limit: u32, remaining: u32, reset_after_s: u64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_after_s.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}
