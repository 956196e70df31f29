//! Composite application state threaded through every filter and handler,
//! the same `#[derive(Clone)]`-over-`Arc`-fields shape as the teacher's
//! `AppState` in `main.rs` (there split via `FromRef` across disparate
//! service types; here a single flat struct since every field here is a
//! gateway-owned component rather than an externally supplied pool/service).

use std::sync::Arc;

use crate::cache_store::CacheStore;
use crate::ccu::{CcuTracker, DashboardMetricsSink};
use crate::config::Config;
use crate::metrics::MetricsRecorder;
use crate::oidc::OidcClient;
use crate::permission::PermissionResolver;
use crate::policy::PolicyManager;
use crate::rate_limit::RateLimitEngine;
use crate::router::UpstreamClient;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache_store: Arc<dyn CacheStore>,
    pub session_store: Arc<SessionStore>,
    pub permission_resolver: Arc<PermissionResolver>,
    pub policy_manager: Arc<PolicyManager>,
    pub rate_limit_engine: Arc<RateLimitEngine>,
    pub upstream_client: Arc<UpstreamClient>,
    pub ccu: Arc<CcuTracker>,
    pub dashboard: Arc<DashboardMetricsSink>,
    pub oidc: Arc<OidcClient>,
    pub metrics: Arc<MetricsRecorder>,
}
