//! CCU Heartbeat and Metrics Sink (spec §4.8): the enrichment filter's
//! best-effort `online:<user_id>` presence write, a periodic scanner that
//! turns presence keys into the `ccu_total` gauge, and the dashboard counter
//! batch the metrics filter writes on every request. All cache-store writes
//! here are fail-open: telemetry never fails a request (spec §7, "Fail-open
//! on metrics errors"). Grounded in the teacher's `jobs::` worker shape
//! (`tokio::spawn` + `tokio::time::interval` background loops) and
//! `metrics.rs`'s `metrics::{counter,gauge,histogram}!` usage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::cache_store::CacheStore;

const ONLINE_KEY_PREFIX: &str = "online:";
const SLOW_CALL_THRESHOLD_MS: u64 = 500;
const LATENCY_EMA_ALPHA: f64 = 0.2;

fn online_key(user_id: &str) -> String {
    format!("{ONLINE_KEY_PREFIX}{user_id}")
}

fn now_epoch_s() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Writes and scans `online:<user_id>` presence keys (spec §3 Online
/// Presence Key, §4.8 scanner path).
pub struct CcuTracker {
    cache_store: Arc<dyn CacheStore>,
    deadline: Duration,
    online_ttl: Duration,
}

impl CcuTracker {
    pub fn new(cache_store: Arc<dyn CacheStore>, deadline: Duration, online_ttl: Duration) -> Self {
        Self { cache_store, deadline, online_ttl }
    }

    /// Fires a best-effort presence refresh. Called from the enrichment
    /// filter after a successful session lookup; the write happens on a
    /// detached task so it never adds latency to the request it rode in on,
    /// and its failure is only logged (spec §4.8: "its failure is logged but
    /// never fails the request").
    pub fn mark_online_async(self: &Arc<Self>, user_id: String) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = tracker
                .cache_store
                .set(&online_key(&user_id), "1", tracker.online_ttl, tracker.deadline)
                .await
            {
                tracing::warn!(user_id, error = %err, "failed to refresh online presence key");
            }
        });
    }

    /// Scans `online:*` and returns the count of distinct online users.
    pub async fn scan_online_count(&self) -> Option<usize> {
        match self
            .cache_store
            .scan(&format!("{ONLINE_KEY_PREFIX}*"), 200, self.deadline)
            .await
        {
            Ok(keys) => Some(keys.len()),
            Err(err) => {
                tracing::warn!(error = %err, "ccu scan failed, skipping this tick");
                None
            }
        }
    }

    /// Spawns the periodic scanner (spec §4.8, default every 30s) updating
    /// the in-process `ccu_total` gauge.
    pub fn spawn_scanner(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Some(count) = self.scan_online_count().await {
                    metrics::gauge!("ccu_total").set(count as f64);
                }
            }
        });
    }
}

#[derive(Default, Clone)]
struct SlowEndpointStats {
    avg_ms: f64,
    p95_ms: f64,
    calls: u64,
}

/// Writes the dashboard counters the global metrics filter batches per
/// request (spec §4.8): rps, request/error counts, a rolling traffic
/// history bucketed by second, a latency EMA, and a per-endpoint slow-call
/// table for requests over 500ms.
pub struct DashboardMetricsSink {
    cache_store: Arc<dyn CacheStore>,
    deadline: Duration,
    slow_endpoints: Mutex<HashMap<String, SlowEndpointStats>>,
}

impl DashboardMetricsSink {
    pub fn new(cache_store: Arc<dyn CacheStore>, deadline: Duration) -> Self {
        Self { cache_store, deadline, slow_endpoints: Mutex::new(HashMap::new()) }
    }

    /// Records one completed request. Never returns an error: every write is
    /// best-effort and logged on failure, matching the filter chain's
    /// "metrics never break a request" rule (spec §7).
    pub async fn record_request(&self, method: &str, path: &str, is_error: bool, duration: Duration) {
        let bucket = now_epoch_s();
        let mut ops = vec![
            ("dashboard:rps".to_string(), Duration::from_secs(2)),
            ("dashboard:request:count".to_string(), Duration::ZERO),
            (format!("dashboard:traffic:history:{bucket}:requests"), Duration::from_secs(86_400)),
        ];
        if is_error {
            ops.push(("dashboard:error:count".to_string(), Duration::ZERO));
            ops.push((format!("dashboard:traffic:history:{bucket}:errors"), Duration::from_secs(86_400)));
        }
        if let Err(err) = self.cache_store.pipeline_incr_with_ttl(&ops, self.deadline).await {
            tracing::warn!(error = %err, "dashboard counter batch failed");
        }

        self.update_latency_ema(duration).await;

        let duration_ms = duration.as_millis() as u64;
        if duration_ms > SLOW_CALL_THRESHOLD_MS {
            self.record_slow_endpoint(method, path, duration_ms).await;
        }
    }

    async fn update_latency_ema(&self, duration: Duration) {
        const KEY: &str = "dashboard:latency:avg";
        let sample = duration.as_millis() as f64;
        let previous = self
            .cache_store
            .get(KEY, self.deadline)
            .await
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or(sample);
        let updated = previous * (1.0 - LATENCY_EMA_ALPHA) + sample * LATENCY_EMA_ALPHA;
        let _ = self
            .cache_store
            .set(KEY, &format!("{updated:.3}"), Duration::from_secs(86_400), self.deadline)
            .await;
    }

    /// Local (per-replica) slow-endpoint table, periodically flushed to the
    /// cache store under `dashboard:slow:endpoint:<METHOD>:<PATH>:*`. p95 is
    /// tracked with a skewed EMA (moves faster toward the tail than the
    /// mean) rather than a full histogram, which is accurate enough for a
    /// dashboard hint and far cheaper than retaining every sample.
    async fn record_slow_endpoint(&self, method: &str, path: &str, duration_ms: u64) {
        let key = format!("{method}:{path}");
        let stats = {
            let mut table = self.slow_endpoints.lock();
            let entry = table.entry(key).or_default();
            entry.calls += 1;
            let sample = duration_ms as f64;
            entry.avg_ms = if entry.calls == 1 { sample } else { entry.avg_ms * 0.8 + sample * 0.2 };
            entry.p95_ms = if sample > entry.p95_ms {
                entry.p95_ms + 0.05 * (sample - entry.p95_ms)
            } else {
                entry.p95_ms - 0.01 * (entry.p95_ms - sample)
            };
            entry.clone()
        };
        let prefix = format!("dashboard:slow:endpoint:{method}:{path}");
        let ttl = Duration::from_secs(86_400);
        let _ = self.cache_store.set(&format!("{prefix}:avg"), &format!("{:.1}", stats.avg_ms), ttl, self.deadline).await;
        let _ = self.cache_store.set(&format!("{prefix}:p95"), &format!("{:.1}", stats.p95_ms), ttl, self.deadline).await;
        let _ = self.cache_store.set(&format!("{prefix}:calls"), &stats.calls.to_string(), ttl, self.deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::testing::FakeCacheStore;

    #[tokio::test]
    async fn mark_online_async_eventually_writes_presence_key() {
        let store = Arc::new(FakeCacheStore::default());
        let tracker = Arc::new(CcuTracker::new(store.clone(), Duration::from_secs(1), Duration::from_secs(120)));
        tracker.mark_online_async("u1".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("online:u1", Duration::from_secs(1)).await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn scan_online_count_counts_presence_keys() {
        let store = Arc::new(FakeCacheStore::default());
        store.set("online:u1", "1", Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();
        store.set("online:u2", "1", Duration::from_secs(60), Duration::from_secs(1)).await.unwrap();
        let tracker = CcuTracker::new(store, Duration::from_secs(1), Duration::from_secs(120));
        assert_eq!(tracker.scan_online_count().await, Some(2));
    }

    #[tokio::test]
    async fn record_request_increments_dashboard_counters() {
        let store = Arc::new(FakeCacheStore::default());
        let sink = DashboardMetricsSink::new(store.clone(), Duration::from_secs(1));
        sink.record_request("GET", "/api/products/123", false, Duration::from_millis(10)).await;
        assert_eq!(store.get("dashboard:request:count", Duration::from_secs(1)).await.unwrap(), Some("1".to_string()));
    }
}
