//! Cache Store Adapter (spec §4.1).
//!
//! Abstracts a remote key/value store with string/counter ops, TTLs, pipelined
//! writes, scan iteration and pub/sub. Every operation takes a deadline; on
//! failure (including deadline expiry) the adapter returns `CacheUnavailable`
//! and never retries internally — callers pick their own fallback policy, the
//! way the rest of the gateway is written to degrade explicitly rather than
//! hide failures behind hidden retries.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::GatewayError;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str, deadline: Duration) -> Result<Option<String>, GatewayError>;
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<(), GatewayError>;
    async fn del(&self, key: &str, deadline: Duration) -> Result<(), GatewayError>;
    async fn incr(&self, key: &str, deadline: Duration) -> Result<i64, GatewayError>;
    async fn expire(&self, key: &str, ttl: Duration, deadline: Duration) -> Result<(), GatewayError>;

    /// Atomic compare-and-swap used by the rate limit engine's distributed
    /// token bucket: replaces `key` with `new` (and sets `ttl`) only if its
    /// current value equals `expected`, or if the key is absent. Returns
    /// whether the swap took place.
    async fn eval_cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<bool, GatewayError>;

    async fn pipeline_incr_with_ttl(
        &self,
        ops: &[(String, Duration)],
        deadline: Duration,
    ) -> Result<Vec<i64>, GatewayError>;

    /// Non-blocking cursor scan over keys matching `pattern`, `batch_size` keys
    /// at a time. Returns the full (eventually consistent) key list; callers
    /// that only need a count should just take `.len()`.
    async fn scan(&self, pattern: &str, batch_size: usize, deadline: Duration)
        -> Result<Vec<String>, GatewayError>;

    async fn publish(&self, channel: &str, message: &str, deadline: Duration) -> Result<(), GatewayError>;
}

#[derive(Clone)]
pub struct RedisCacheStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisCacheStore {
    pub async fn connect(addr: &str, password: Option<&str>) -> Result<Self, GatewayError> {
        let mut info: redis::ConnectionInfo = redis::IntoConnectionInfo::into_connection_info(addr)
            .map_err(|e| GatewayError::ConfigInvalid(format!("cache_store.addr: {e}")))?;
        if let Some(pw) = password {
            info.redis.password = Some(pw.to_string());
        }
        let client = redis::Client::open(info)
            .map_err(|e| GatewayError::ConfigInvalid(format!("cache_store.addr: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|_| GatewayError::CacheUnavailable)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> redis::aio::ConnectionManager {
        self.manager.clone()
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, GatewayError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(GatewayError::CacheUnavailable),
        Err(_) => Err(GatewayError::CacheUnavailable),
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str, deadline: Duration) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn();
        with_deadline(deadline, conn.get(key)).await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let mut conn = self.conn();
        with_deadline(
            deadline,
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)),
        )
        .await
    }

    async fn del(&self, key: &str, deadline: Duration) -> Result<(), GatewayError> {
        let mut conn = self.conn();
        with_deadline(deadline, conn.del::<_, ()>(key)).await
    }

    async fn incr(&self, key: &str, deadline: Duration) -> Result<i64, GatewayError> {
        let mut conn = self.conn();
        with_deadline(deadline, conn.incr(key, 1)).await
    }

    async fn expire(&self, key: &str, ttl: Duration, deadline: Duration) -> Result<(), GatewayError> {
        let mut conn = self.conn();
        with_deadline(deadline, conn.expire::<_, ()>(key, ttl.as_secs() as i64)).await
    }

    async fn eval_cas(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<bool, GatewayError> {
        // Lua keeps the compare-and-set atomic across concurrent replicas,
        // same pattern as a Redis-backed sliding-window limiter: read, branch,
        // write, all inside one EVAL so no other client can interleave.
        const SCRIPT: &str = r#"
            local current = redis.call('GET', KEYS[1])
            if (ARGV[1] == '' and current == false) or current == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
                return 1
            else
                return 0
            end
        "#;
        let script = redis::Script::new(SCRIPT);
        let mut conn = self.conn();
        let result: i64 = with_deadline(
            deadline,
            script
                .key(key)
                .arg(expected.unwrap_or(""))
                .arg(new)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(result == 1)
    }

    async fn pipeline_incr_with_ttl(
        &self,
        ops: &[(String, Duration)],
        deadline: Duration,
    ) -> Result<Vec<i64>, GatewayError> {
        let mut pipe = redis::pipe();
        for (key, ttl) in ops {
            pipe.incr(key, 1);
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        let mut conn = self.conn();
        with_deadline(deadline, pipe.query_async::<Vec<i64>>(&mut conn)).await
    }

    async fn scan(
        &self,
        pattern: &str,
        batch_size: usize,
        deadline: Duration,
    ) -> Result<Vec<String>, GatewayError> {
        let conn = self.conn();
        with_deadline(deadline, scan_all(conn, pattern.to_string(), batch_size)).await
    }

    async fn publish(&self, channel: &str, message: &str, deadline: Duration) -> Result<(), GatewayError> {
        let mut conn = self.conn();
        with_deadline(deadline, conn.publish::<_, _, ()>(channel, message)).await
    }
}

async fn scan_all(
    mut conn: redis::aio::ConnectionManager,
    pattern: String,
    batch_size: usize,
) -> redis::RedisResult<Vec<String>> {
    use futures::StreamExt;
    let mut iter: redis::AsyncIter<String> = conn
        .scan_match_options(
            &pattern,
            redis::ScanOptions::default().with_count(batch_size),
        )
        .await?;
    let mut keys = Vec::new();
    while let Some(key) = iter.next().await {
        keys.push(key);
    }
    Ok(keys)
}

/// In-memory fake used across unit and integration tests that don't need a
/// real Redis — mirrors the trait so filter/engine tests can run without a
/// cache store available, the same "fail gracefully in isolation" shape the
/// spec asks of every component that touches the cache.
pub mod testing {
    use super::*;

    #[derive(Default, Clone)]
    pub struct FakeCacheStore {
        pub data: std::sync::Arc<parking_lot::Mutex<std::collections::HashMap<String, String>>>,
        pub unavailable: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl CacheStore for FakeCacheStore {
        async fn get(&self, key: &str, _deadline: Duration) -> Result<Option<String>, GatewayError> {
            if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::CacheUnavailable);
            }
            Ok(self.data.lock().get(key).cloned())
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            _ttl: Duration,
            _deadline: Duration,
        ) -> Result<(), GatewayError> {
            if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::CacheUnavailable);
            }
            self.data.lock().insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn del(&self, key: &str, _deadline: Duration) -> Result<(), GatewayError> {
            self.data.lock().remove(key);
            Ok(())
        }

        async fn incr(&self, key: &str, _deadline: Duration) -> Result<i64, GatewayError> {
            let mut data = self.data.lock();
            let entry = data.entry(key.to_string()).or_insert_with(|| "0".into());
            let next = entry.parse::<i64>().unwrap_or(0) + 1;
            *entry = next.to_string();
            Ok(next)
        }

        async fn expire(&self, _key: &str, _ttl: Duration, _deadline: Duration) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn eval_cas(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
            _ttl: Duration,
            _deadline: Duration,
        ) -> Result<bool, GatewayError> {
            if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::CacheUnavailable);
            }
            let mut data = self.data.lock();
            let current = data.get(key).map(|s| s.as_str());
            let matches = match expected {
                None => current.is_none(),
                Some(e) => current == Some(e),
            };
            if matches {
                data.insert(key.to_string(), new.to_string());
            }
            Ok(matches)
        }

        async fn pipeline_incr_with_ttl(
            &self,
            ops: &[(String, Duration)],
            deadline: Duration,
        ) -> Result<Vec<i64>, GatewayError> {
            let mut out = Vec::with_capacity(ops.len());
            for (k, _) in ops {
                out.push(self.incr(k, deadline).await?);
            }
            Ok(out)
        }

        async fn scan(
            &self,
            pattern: &str,
            _batch_size: usize,
            _deadline: Duration,
        ) -> Result<Vec<String>, GatewayError> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .data
                .lock()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn publish(&self, _channel: &str, _message: &str, _deadline: Duration) -> Result<(), GatewayError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeCacheStore;
    use super::*;

    #[tokio::test]
    async fn fake_eval_cas_only_swaps_on_match() {
        let store = FakeCacheStore::default();
        store.set("k", "1", Duration::from_secs(1), Duration::from_secs(1)).await.unwrap();
        assert!(!store
            .eval_cas("k", Some("2"), "3", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store
            .eval_cas("k", Some("1"), "3", Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.get("k", Duration::from_secs(1)).await.unwrap().unwrap(), "3");
    }

    #[tokio::test]
    async fn fake_scan_filters_by_prefix() {
        let store = FakeCacheStore::default();
        store.set("online:u1", "1", Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();
        store.set("session:abc", "1", Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();
        let keys = store.scan("online:*", 100, Duration::from_secs(1)).await.unwrap();
        assert_eq!(keys, vec!["online:u1".to_string()]);
    }
}
