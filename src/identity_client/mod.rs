//! Identity service RPC client (spec §4.4, §6): the one production
//! implementation of `permission::IdentityRpc`, routed through the same
//! Router + Upstream Client that fronts every other upstream so the
//! permission lookup inherits bulkhead/breaker/retry for free (spec §4.4:
//! "issues a GET ... via the Upstream Client (thus covered by
//! breaker/retry/bulkhead)"). Grounded in the teacher's `xrpc_proxy::proxy`
//! call shape, routed through our own `router::UpstreamClient` instead of a
//! bare `reqwest::Client`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::permission::IdentityRpc;
use crate::router::{ForwardRequest, UpstreamClient};

pub const IDENTITY_SERVICE_NAME: &str = "identity-service";

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    granted: bool,
}

#[derive(Debug, Deserialize)]
struct RolesResponse {
    roles: Vec<String>,
}

pub struct IdentityServiceClient {
    upstream: Arc<UpstreamClient>,
    read_timeout: Duration,
}

impl IdentityServiceClient {
    pub fn new(upstream: Arc<UpstreamClient>, read_timeout: Duration) -> Self {
        Self { upstream, read_timeout }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: String) -> Result<T, GatewayError> {
        let request = ForwardRequest {
            service: IDENTITY_SERVICE_NAME.to_string(),
            method: Method::GET,
            path,
            headers: HeaderMap::new(),
            body: Default::default(),
        };
        let response = self
            .upstream
            .forward(request, self.read_timeout)
            .await
            .map_err(|_| GatewayError::IdentityUnavailable)?;
        if !response.status.is_success() {
            return Err(GatewayError::IdentityUnavailable);
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| GatewayError::Internal(format!("identity response decode: {e}")))
    }
}

#[async_trait]
impl IdentityRpc for IdentityServiceClient {
    async fn check_permission(&self, user_id: &str, code: &str) -> Result<bool, GatewayError> {
        let path = format!(
            "/api/internal/permissions?user={}&code={}",
            urlencoding::encode(user_id),
            urlencoding::encode(code)
        );
        let body: PermissionResponse = self.get_json(path).await?;
        Ok(body.granted)
    }

    async fn list_roles(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        let path = format!("/api/internal/roles?user={}", urlencoding::encode(user_id));
        let body: RolesResponse = self.get_json(path).await?;
        Ok(body.roles)
    }
}
