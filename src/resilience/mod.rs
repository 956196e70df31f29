//! Resilience Primitives (spec §4.2): circuit breaker, retry-with-backoff,
//! bounded-concurrency bulkhead, token-bucket rate limiter. Each is a plain
//! struct driven by explicit `await`ed method calls — the same shape as the
//! teacher's `middleware::rate_limit::RateLimiter`/`TokenBucket` rather than a
//! generic `tower::Layer` — so the Router can wire them up as a visible
//! `bulkhead.acquire().await?; breaker.check()?; retry.call(...).await` chain.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod retry;
pub mod token_bucket;

pub use bulkhead::Bulkhead;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;
pub use token_bucket::TokenBucket;

/// Classifies an outcome for the circuit breaker and retry policy. Argument
/// validation failures are excluded from both the breaker's sliding window
/// and retry eligibility (spec §4.2, design note §9.3: the breaker abstracts
/// "failure" to a classification predicate rather than hard-coding one
/// exception type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    SlowSuccess,
    Failure,
    ValidationError,
}
