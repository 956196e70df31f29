//! Retry-with-backoff (spec §4.2): max 3 attempts, exponential backoff base
//! 100ms multiplier 2 (100, 200, 400ms). Retries transport-classified
//! failures only; cooperates with the circuit breaker by never retrying past
//! an `CircuitOpen` fast-fail.

use std::time::Duration;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

/// Whether a given error is worth another attempt. Validation/state errors
/// and an already-open circuit are never retried.
fn is_retryable(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::UpstreamTimeout | GatewayError::Upstream5xx | GatewayError::CacheUnavailable
    )
}

impl RetryPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(self.base_interval.as_secs_f64() * factor)
    }

    /// Runs `op` up to `max_attempts` times, sleeping the exponential backoff
    /// between attempts. Stops immediately on a non-retryable error (in
    /// particular `CircuitOpen`, so a breaker trip fails fast rather than
    /// being retried into the ground).
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.max_attempts && is_retryable(&err) => {
                    tokio::time::sleep(self.backoff_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_interval: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = policy
            .call(|| {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(GatewayError::UpstreamTimeout)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_circuit_open() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), GatewayError> = policy
            .call(|| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::CircuitOpen("business-service".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
