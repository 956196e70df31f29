//! Token bucket primitive (spec §4.2): capacity C, greedy refill of C tokens
//! per minute. This is the local, in-process form used directly by the
//! breaker/bulkhead test harness and as the Rate Limit Engine's fallback
//! cache when the distributed cache store is unavailable. Grounded in the
//! teacher's `middleware::rate_limit::TokenBucket`, generalized from a
//! per-second refill rate to the spec's per-minute capacity terms.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

pub struct ConsumeResult {
    pub admitted: bool,
    pub tokens_remaining: u32,
    pub reset_after: Duration,
}

impl TokenBucket {
    /// `capacity` tokens, fully refilled every 60 seconds (greedy refill).
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: capacity as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, n: u32) -> ConsumeResult {
        self.refill();
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            ConsumeResult {
                admitted: true,
                tokens_remaining: self.tokens.floor() as u32,
                reset_after: self.reset_after(),
            }
        } else {
            ConsumeResult {
                admitted: false,
                tokens_remaining: self.tokens.floor() as u32,
                reset_after: self.reset_after(),
            }
        }
    }

    fn reset_after(&self) -> Duration {
        if self.tokens >= self.capacity {
            Duration::ZERO
        } else {
            let missing = self.capacity - self.tokens;
            Duration::from_secs_f64((missing / self.refill_per_sec).max(0.0))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_denies() {
        let mut bucket = TokenBucket::new(3);
        assert!(bucket.try_consume(1).admitted);
        assert!(bucket.try_consume(1).admitted);
        assert!(bucket.try_consume(1).admitted);
        assert!(!bucket.try_consume(1).admitted);
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(60); // 1 token/sec
        for _ in 0..60 {
            bucket.try_consume(1);
        }
        assert!(!bucket.try_consume(1).admitted);
        std::thread::sleep(Duration::from_millis(1100));
        assert!(bucket.try_consume(1).admitted);
    }
}
