//! CSRF Protection filter (spec §4.6, order −10): for mutating methods on
//! non-public paths, requires one of `X-XSRF-TOKEN`, `X-Requested-With`,
//! `X-CSRF-TOKEN`. Short-circuits with 403 if none is present.

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::filters::{is_public_path, RequestContext};

const CSRF_HEADERS: &[&str] = &["x-xsrf-token", "x-requested-with", "x-csrf-token"];

fn is_mutating(method: &Method) -> bool {
    matches!(method, &Method::POST | &Method::PUT | &Method::PATCH | &Method::DELETE)
}

pub async fn layer(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if is_mutating(request.method()) && !is_public_path(path) {
        let has_header = CSRF_HEADERS.iter().any(|name| request.headers().contains_key(*name));
        if !has_header {
            let trace_id = request
                .extensions()
                .get::<RequestContext>()
                .map(|ctx| ctx.trace_id.clone())
                .unwrap_or_default();
            return GatewayError::CsrfMissing.into_response_with_trace(trace_id).into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_put_are_distinguished_by_mutation() {
        assert!(!is_mutating(&Method::GET));
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::DELETE));
    }
}
