//! Circuit breaker (spec §4.2): one per upstream service name, CLOSED /
//! OPEN / HALF_OPEN with a count-based sliding window. Grounded in the
//! upstream-call-protection idiom of the teacher's `middleware::rate_limit`
//! (per-key state behind an `Arc<parking_lot::Mutex<..>>>`, explicit methods
//! rather than a tower layer), with the state machine itself informed by the
//! `tower-resilience` circuit-breaker crate's `Circuit` design (reimplemented
//! here as a plain struct, not a generic `Layer`).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::Outcome;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_rate_pct: f64,
    pub slow_call_ms: u64,
    pub wait_duration: Duration,
    pub permitted_half_open: u32,
    pub sliding_window_size: usize,
    pub minimum_number_of_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_pct: 50.0,
            slow_call_ms: 2_000,
            wait_duration: Duration::from_secs(10),
            permitted_half_open: 10,
            sliding_window_size: 100,
            minimum_number_of_calls: 10,
        }
    }
}

struct Inner {
    state: CircuitState,
    window: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    half_open_probes_issued: u32,
    half_open_results: VecDeque<Outcome>,
}

/// One breaker guards one upstream service name. `try_acquire` must be
/// called before the transport call, `record_outcome` after it completes (or
/// is classified as too slow).
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window_capacity = config.sliding_window_size;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(window_capacity),
                opened_at: None,
                half_open_probes_issued: 0,
                half_open_results: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Call before dialing the upstream. Returns `CircuitOpen` if the call
    /// must be rejected without any transport I/O.
    pub fn try_acquire(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.wait_duration {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes_issued = 1;
                    inner.half_open_results.clear();
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes_issued < self.config.permitted_half_open {
                    inner.half_open_probes_issued += 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    /// Call after the guarded operation completes, classifying its outcome.
    pub fn record_outcome(&self, outcome: Outcome) {
        if outcome == Outcome::ValidationError {
            // excluded from the window entirely, per spec §9.3
            return;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_results.push_back(outcome);
                if (inner.half_open_results.len() as u32) >= self.config.permitted_half_open {
                    if failure_rate(&inner.half_open_results) >= self.config.failure_rate_pct {
                        self.transition_to(&mut inner, CircuitState::Open);
                    } else {
                        self.transition_to(&mut inner, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Closed => {
                inner.window.push_back(outcome);
                if inner.window.len() > self.config.sliding_window_size {
                    inner.window.pop_front();
                }
                if inner.window.len() >= self.config.minimum_number_of_calls {
                    let fail_rate = failure_rate(&inner.window);
                    let slow_rate = slow_rate(&inner.window);
                    if fail_rate >= self.config.failure_rate_pct
                        || slow_rate >= self.config.failure_rate_pct
                    {
                        self.transition_to(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        tracing::info!(service = %self.name, from = ?inner.state, to = ?next, "circuit breaker transition");
        metrics::counter!("circuit_breaker_transitions_total", "service" => self.name.clone(), "to" => format!("{next:?}")).increment(1);
        inner.state = next;
        match next {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.window.clear();
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }
}

fn failure_rate(window: &VecDeque<Outcome>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window
        .iter()
        .filter(|o| matches!(o, Outcome::Failure))
        .count();
    (failures as f64 / window.len() as f64) * 100.0
}

fn slow_rate(window: &VecDeque<Outcome>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let slow = window
        .iter()
        .filter(|o| matches!(o, Outcome::SlowSuccess))
        .count();
    (slow as f64 / window.len() as f64) * 100.0
}
