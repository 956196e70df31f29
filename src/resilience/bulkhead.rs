//! Bulkhead (spec §4.2): bounded semaphore per upstream, max_concurrent=100,
//! acquire-timeout=100ms. Rejects with a typed error rather than queuing
//! indefinitely, so callers can shed load instead of piling up behind a slow
//! upstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::GatewayError;

pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_concurrent: usize, acquire_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            acquire_timeout,
        }
    }

    /// Blocks at most `acquire_timeout` waiting for a slot; returns
    /// `BulkheadRejected` if none frees up in time.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, GatewayError> {
        match tokio::time::timeout(self.acquire_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(GatewayError::BulkheadRejected(self.name.clone())),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_when_exhausted() {
        let bh = Bulkhead::new("business-service", 1, Duration::from_millis(20));
        let _first = bh.acquire().await.unwrap();
        let second = bh.acquire().await;
        assert!(matches!(second, Err(GatewayError::BulkheadRejected(_))));
    }

    #[tokio::test]
    async fn admits_again_once_a_permit_is_released() {
        let bh = Bulkhead::new("business-service", 1, Duration::from_millis(50));
        {
            let _permit = bh.acquire().await.unwrap();
        }
        assert!(bh.acquire().await.is_ok());
    }
}
