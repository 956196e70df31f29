//! Session→Token Enrichment filter (spec §4.6, order −1): reads the
//! `SESSION_ID` cookie (or `X-Session-Id` header fallback). Absent → pass
//! through unmodified (spec §9 open question 1: an unmapped/public resource
//! stays reachable anonymously; the policy decision is left to the
//! Authorization filter's fail-safe rule). Present but not found or expired
//! → 401. Otherwise rewrites the outbound request with a bearer
//! `Authorization` header, stamps `X-User-Id`, records the user id on the
//! request context for Authorization to consume, and fires the CCU presence
//! heartbeat.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::filters::{extract_session_id, RequestContext};
use crate::state::AppState;

fn now_epoch_s() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub async fn layer(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let Some(session_id) = extract_session_id(request.headers()) else {
        return next.run(request).await;
    };

    let trace_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.trace_id.clone())
        .unwrap_or_default();

    let session = match state.session_store.lookup(&session_id).await {
        Ok(Some(session)) if !session.is_access_expired(now_epoch_s()) => session,
        Ok(_) => {
            return GatewayError::Unauthorized("session not found or expired".into())
                .into_response_with_trace(trace_id)
                .into_response();
        }
        Err(err) => {
            tracing::warn!(session_id, error = %err, "session lookup failed");
            return GatewayError::Unauthorized("session lookup failed".into())
                .into_response_with_trace(trace_id)
                .into_response();
        }
    };

    if let Ok(auth_value) = HeaderValue::from_str(&format!("Bearer {}", session.access_token)) {
        request.headers_mut().insert(axum::http::header::AUTHORIZATION, auth_value);
    }
    if let Ok(user_id_value) = HeaderValue::from_str(&session.user_id) {
        request.headers_mut().insert("x-user-id", user_id_value);
    }

    if let Some(ctx) = request.extensions_mut().get_mut::<RequestContext>() {
        ctx.user_id = Some(session.user_id.clone());
    } else {
        request.extensions_mut().insert(RequestContext { trace_id, user_id: Some(session.user_id.clone()) });
    }

    state.ccu.mark_online_async(session.user_id.clone());

    next.run(request).await
}
