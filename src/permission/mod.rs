//! Permission Resolver (spec §4.4): answers "does user U hold permission P?"
//! via an L1+L2 cache, filling from the identity service through the
//! resilience-wrapped upstream client. Fails closed: an identity-service
//! outage resolves to `false` and the negative answer is never cached, so
//! the next request retries the RPC rather than being locked out for the
//! full cache TTL. Grounded in the teacher's `auth.rs` cache-aside DID
//! resolution (`moka` L1 in front of a remote fetch), generalized to two
//! tiers and two independent cache keys (`perm:*`, `roles:*`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use crate::cache_store::CacheStore;
use crate::error::GatewayError;

/// The identity service's permission/roles RPC, abstracted so the resolver
/// is testable without a live HTTP dependency. The production implementation
/// lives in `identity_client` and is itself wrapped in bulkhead/breaker/retry
/// via the Upstream Client.
#[async_trait]
pub trait IdentityRpc: Send + Sync {
    async fn check_permission(&self, user_id: &str, code: &str) -> Result<bool, GatewayError>;
    async fn list_roles(&self, user_id: &str) -> Result<Vec<String>, GatewayError>;
}

const L1_MAX: u64 = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(300);

pub struct PermissionResolver {
    cache_store: Arc<dyn CacheStore>,
    identity: Arc<dyn IdentityRpc>,
    deadline: Duration,
    perm_l1: Cache<String, bool>,
    roles_l1: Cache<String, Arc<Vec<String>>>,
}

fn perm_key(user_id: &str, code: &str) -> String {
    format!("perm:{user_id}:{code}")
}

fn roles_key(user_id: &str) -> String {
    format!("roles:{user_id}")
}

impl PermissionResolver {
    pub fn new(cache_store: Arc<dyn CacheStore>, identity: Arc<dyn IdentityRpc>, deadline: Duration) -> Self {
        Self {
            cache_store,
            identity,
            deadline,
            perm_l1: Cache::builder().max_capacity(L1_MAX).time_to_live(CACHE_TTL).build(),
            roles_l1: Cache::builder().max_capacity(L1_MAX).time_to_live(CACHE_TTL).build(),
        }
    }

    pub async fn has_permission(&self, user_id: &str, permission_code: &str) -> bool {
        let cache_key = perm_key(user_id, permission_code);

        if let Some(granted) = self.perm_l1.get(&cache_key).await {
            return granted;
        }

        match self.cache_store.get(&cache_key, self.deadline).await {
            Ok(Some(raw)) => {
                let granted = raw == "1";
                self.perm_l1.insert(cache_key, granted).await;
                return granted;
            }
            Ok(None) => {}
            Err(_) => {
                // L2 unavailable: fall through to L1-miss behavior, relying
                // on L1 + the identity RPC per spec §7's degradation rule.
            }
        }

        match self.identity.check_permission(user_id, permission_code).await {
            Ok(granted) => {
                self.perm_l1.insert(cache_key.clone(), granted).await;
                let _ = self
                    .cache_store
                    .set(&cache_key, if granted { "1" } else { "0" }, CACHE_TTL, self.deadline)
                    .await;
                granted
            }
            Err(_) => {
                tracing::warn!(user_id, permission_code, "identity service unavailable, failing closed");
                false
            }
        }
    }

    pub async fn user_roles(&self, user_id: &str) -> Vec<String> {
        let cache_key = roles_key(user_id);

        if let Some(roles) = self.roles_l1.get(&cache_key).await {
            return (*roles).clone();
        }

        if let Ok(Some(raw)) = self.cache_store.get(&cache_key, self.deadline).await {
            if let Ok(roles) = serde_json::from_str::<Vec<String>>(&raw) {
                self.roles_l1.insert(cache_key, Arc::new(roles.clone())).await;
                return roles;
            }
        }

        match self.identity.list_roles(user_id).await {
            Ok(roles) => {
                self.roles_l1.insert(cache_key.clone(), Arc::new(roles.clone())).await;
                if let Ok(raw) = serde_json::to_string(&roles) {
                    let _ = self.cache_store.set(&cache_key, &raw, CACHE_TTL, self.deadline).await;
                }
                roles
            }
            Err(_) => {
                tracing::warn!(user_id, "identity service unavailable, returning no roles");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::testing::FakeCacheStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeIdentity {
        granted: bool,
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl IdentityRpc for FakeIdentity {
        async fn check_permission(&self, _user_id: &str, _code: &str) -> Result<bool, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GatewayError::IdentityUnavailable)
            } else {
                Ok(self.granted)
            }
        }

        async fn list_roles(&self, _user_id: &str) -> Result<Vec<String>, GatewayError> {
            Ok(vec!["member".to_string()])
        }
    }

    #[tokio::test]
    async fn caches_a_granted_permission_after_first_rpc() {
        let cache_store = Arc::new(FakeCacheStore::default());
        let identity = Arc::new(FakeIdentity { granted: true, calls: AtomicU32::new(0), fail: false });
        let resolver = PermissionResolver::new(cache_store, identity.clone(), Duration::from_secs(1));
        assert!(resolver.has_permission("u1", "product:read").await);
        assert!(resolver.has_permission("u1", "product:read").await);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fails_closed_and_does_not_cache_when_identity_unavailable() {
        let cache_store = Arc::new(FakeCacheStore::default());
        let identity = Arc::new(FakeIdentity { granted: true, calls: AtomicU32::new(0), fail: true });
        let resolver = PermissionResolver::new(cache_store, identity.clone(), Duration::from_secs(1));
        assert!(!resolver.has_permission("u1", "product:read").await);
        assert!(!resolver.has_permission("u1", "product:read").await);
        assert_eq!(identity.calls.load(Ordering::SeqCst), 2);
    }
}
