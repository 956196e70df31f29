//! Session Store (spec §3 Session, §4.3): binds an opaque session id to an
//! {access token, refresh token, user id, expiry, metadata} tuple. L1 is an
//! in-process bounded cache (moka, 100k entries, 60s TTL — deliberately
//! shorter than the access token lifetime to bound staleness); L2 is the
//! cache store under `session:<id>`. Grounded in the teacher's cache-aside
//! DID-document cache in `auth.rs` (`moka::future::Cache` fronting a remote
//! fetch), generalized to a read/write store instead of a read-through one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use moka::future::Cache;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::cache_store::CacheStore;
use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expiry_epoch_s: u64,
    pub refresh_expiry_epoch_s: u64,
    pub idp_subject: String,
    pub issued_at_epoch_s: u64,
    pub last_seen_at_epoch_s: u64,
    pub metadata: HashMap<String, String>,
}

impl Session {
    pub fn is_access_expired(&self, now: u64) -> bool {
        now >= self.access_expiry_epoch_s
    }

    pub fn is_refresh_expired(&self, now: u64) -> bool {
        now >= self.refresh_expiry_epoch_s
    }
}

const L1_TTL: Duration = Duration::from_secs(60);
const L1_MAX: u64 = 100_000;
const INVALIDATION_CHANNEL: &str = "session:invalidate";
/// Slack added on top of the session's own expiry so L2 always outlives the
/// tokens it stores, per spec §4.3 ("TTL equal to max(refresh_expiry,
/// access_expiry) + slack").
const L2_TTL_SLACK: Duration = Duration::from_secs(300);

pub struct SessionStore {
    cache_store: Arc<dyn CacheStore>,
    deadline: Duration,
    l1: Cache<String, Session>,
}

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl SessionStore {
    pub fn new(cache_store: Arc<dyn CacheStore>, deadline: Duration, l1_max: u64, l1_ttl: Duration) -> Self {
        Self {
            cache_store,
            deadline,
            l1: Cache::builder()
                .max_capacity(if l1_max == 0 { L1_MAX } else { l1_max })
                .time_to_live(if l1_ttl.is_zero() { L1_TTL } else { l1_ttl })
                .build(),
        }
    }

    /// Writes L2 first and only returns the session id once that write is
    /// acknowledged — a session that didn't reach L2 cannot survive a
    /// replica restart, so `create` fails closed on cache unavailability
    /// instead of handing back an id the client will later find invalid
    /// (spec §4.3, tested by scenario S6).
    pub async fn create(
        &self,
        user_id: &str,
        idp_subject: &str,
        access_token: &str,
        refresh_token: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
        metadata: HashMap<String, String>,
    ) -> Result<String, GatewayError> {
        let session_id = new_session_id();
        let now = now_epoch_s();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            access_expiry_epoch_s: now + access_ttl.as_secs(),
            refresh_expiry_epoch_s: now + refresh_ttl.as_secs(),
            idp_subject: idp_subject.to_string(),
            issued_at_epoch_s: now,
            last_seen_at_epoch_s: now,
            metadata,
        };
        let payload = serde_json::to_string(&session)
            .map_err(|e| GatewayError::Internal(format!("session serialize: {e}")))?;
        let l2_ttl = refresh_ttl.max(access_ttl) + L2_TTL_SLACK;
        self.cache_store
            .set(&session_key(&session_id), &payload, l2_ttl, self.deadline)
            .await
            .map_err(|_| GatewayError::SessionPersistError)?;
        self.l1.insert(session_id.clone(), session).await;
        Ok(session_id)
    }

    /// L1 first; on miss consults L2 and fills L1 with the shorter L1 TTL.
    /// A session absent from both tiers (or present but expired) is
    /// NotFound, represented here as `Ok(None)` — callers map that to a 401.
    pub async fn lookup(&self, session_id: &str) -> Result<Option<Session>, GatewayError> {
        if let Some(session) = self.l1.get(session_id).await {
            return Ok(Some(session));
        }
        match self.cache_store.get(&session_key(session_id), self.deadline).await {
            Ok(Some(raw)) => {
                let session: Session = serde_json::from_str(&raw)
                    .map_err(|e| GatewayError::Internal(format!("session deserialize: {e}")))?;
                self.l1.insert(session_id.to_string(), session.clone()).await;
                Ok(Some(session))
            }
            Ok(None) => Ok(None),
            Err(GatewayError::CacheUnavailable) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn refresh(
        &self,
        session_id: &str,
        new_access_token: &str,
        new_access_ttl: Duration,
    ) -> Result<Session, GatewayError> {
        let mut session = self
            .lookup(session_id)
            .await?
            .ok_or_else(|| GatewayError::Unauthorized("unknown session".into()))?;
        let now = now_epoch_s();
        session.access_token = new_access_token.to_string();
        session.access_expiry_epoch_s = now + new_access_ttl.as_secs();
        session.last_seen_at_epoch_s = now;
        self.persist(&session).await?;
        Ok(session)
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), GatewayError> {
        if let Some(mut session) = self.lookup(session_id).await? {
            session.last_seen_at_epoch_s = now_epoch_s();
            self.persist(&session).await.ok();
        }
        Ok(())
    }

    async fn persist(&self, session: &Session) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(session)
            .map_err(|e| GatewayError::Internal(format!("session serialize: {e}")))?;
        let remaining_refresh = session
            .refresh_expiry_epoch_s
            .saturating_sub(now_epoch_s());
        let l2_ttl = Duration::from_secs(remaining_refresh) + L2_TTL_SLACK;
        self.cache_store
            .set(&session_key(&session.session_id), &payload, l2_ttl, self.deadline)
            .await
            .map_err(|_| GatewayError::SessionPersistError)?;
        self.l1.insert(session.session_id.clone(), session.clone()).await;
        Ok(())
    }

    /// Removes both tiers and publishes on `session:invalidate` so other
    /// replicas drop their own L1 copy (spec §4.3).
    pub async fn delete(&self, session_id: &str) -> Result<(), GatewayError> {
        self.l1.invalidate(session_id).await;
        let _ = self.cache_store.del(&session_key(session_id), self.deadline).await;
        let _ = self
            .cache_store
            .publish(INVALIDATION_CHANNEL, session_id, self.deadline)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::testing::FakeCacheStore;

    fn store() -> SessionStore {
        let cache = Arc::new(FakeCacheStore::default());
        SessionStore::new(cache, Duration::from_secs(1), 1000, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn create_then_lookup_round_trips() {
        let store = store();
        let id = store
            .create(
                "u1",
                "idp|u1",
                "access-token",
                "refresh-token",
                Duration::from_secs(3600),
                Duration::from_secs(86_400),
                HashMap::new(),
            )
            .await
            .unwrap();
        let session = store.lookup(&id).await.unwrap().unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.access_token, "access-token");
    }

    #[tokio::test]
    async fn delete_makes_lookup_return_none() {
        let store = store();
        let id = store
            .create("u1", "idp|u1", "a", "r", Duration::from_secs(60), Duration::from_secs(60), HashMap::new())
            .await
            .unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.lookup(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_fails_closed_when_cache_store_unavailable() {
        let cache = Arc::new(FakeCacheStore::default());
        cache.unavailable.store(true, std::sync::atomic::Ordering::SeqCst);
        let store = SessionStore::new(cache, Duration::from_secs(1), 1000, Duration::from_secs(60));
        let result = store
            .create("u1", "idp|u1", "a", "r", Duration::from_secs(60), Duration::from_secs(60), HashMap::new())
            .await;
        assert!(matches!(result, Err(GatewayError::SessionPersistError)));
    }

    #[tokio::test]
    async fn refresh_updates_access_token_and_expiry() {
        let store = store();
        let id = store
            .create("u1", "idp|u1", "old", "r", Duration::from_secs(60), Duration::from_secs(3600), HashMap::new())
            .await
            .unwrap();
        let session = store.refresh(&id, "new", Duration::from_secs(120)).await.unwrap();
        assert_eq!(session.access_token, "new");
    }
}
