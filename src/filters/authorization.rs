//! Authorization filter (spec §4.6, order 0): the last filter in the chain,
//! running closest to the router. Looks up the matching policy entry for
//! {method, path}; an unmapped resource or one explicitly flagged
//! `is_public` passes through untouched (fail-safe, spec §4.5/§4.6). A
//! mapped, non-public resource requires a user id on the request context
//! (populated by [`crate::filters::enrichment`]) and a granted permission
//! from the [`crate::permission::PermissionResolver`]; otherwise 401/403.
//! On success stamps `X-AuthZ-Perm` for the upstream to see which policy
//! admitted the call.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::filters::RequestContext;
use crate::state::AppState;

pub async fn layer(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let trace_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.trace_id.clone())
        .unwrap_or_default();

    let Some(policy) = state.policy_manager.find_policy(&method, &path) else {
        // No policy entry matches this resource: fail-safe pass-through
        // (spec §4.5 — an unmapped resource is not implicitly protected).
        return next.run(request).await;
    };

    if policy.is_public {
        return next.run(request).await;
    }

    let user_id = request.extensions().get::<RequestContext>().and_then(|ctx| ctx.user_id.clone());
    let Some(user_id) = user_id else {
        return GatewayError::Unauthorized("authentication required".into())
            .into_response_with_trace(trace_id)
            .into_response();
    };

    let Some(permission_code) = policy.permission_code else {
        // A non-public policy with no permission code requires only a
        // session, already established above.
        return next.run(request).await;
    };

    if !state.permission_resolver.has_permission(&user_id, &permission_code).await {
        return GatewayError::Forbidden(permission_code).into_response_with_trace(trace_id).into_response();
    }

    if let Ok(value) = HeaderValue::from_str(&permission_code) {
        request.headers_mut().insert("x-authz-perm", value);
    }

    next.run(request).await
}
