//! Per-node circuit breaker.
//!
//! A three-state automaton gating outbound RPCs by recent error rate:
//!
//! ```text
//! closed ──(error rate ≥ threshold, ≥ min samples)──► open
//! open ──(reset timeout elapses)──► half-open
//! half-open ──(N consecutive successes)──► closed
//! half-open ──(any failure)──► open
//! ```
//!
//! Outcomes are kept in a rolling time window; everything takes an explicit
//! `now` so state transitions replay deterministically in tests.

use parleyconf::CircuitConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
}

/// Rolling-window circuit breaker for one node.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    window: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// May a call go out right now?
    ///
    /// While half-open this admits up to `half_open_requests` trial calls,
    /// then refuses until their outcomes are recorded.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_millis(self.config.reset_timeout_ms) {
                    self.transition(CircuitState::HalfOpen);
                    self.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_admitted < self.config.half_open_requests {
                    self.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a call outcome and apply any state transition it causes.
    pub fn record(&mut self, success: bool, now: Instant) {
        self.window.push_back(Outcome { at: now, success });
        self.evict(now);

        match self.state {
            CircuitState::Closed => {
                if self.window.len() >= self.config.min_samples
                    && self.error_rate() >= self.config.error_threshold
                {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.half_open_successes += 1;
                    if self.half_open_successes >= self.config.half_open_requests {
                        self.transition(CircuitState::Closed);
                        self.window.clear();
                    }
                } else {
                    self.trip(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current error rate over the (already evicted) window.
    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|o| !o.success).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    fn trip(&mut self, now: Instant) {
        self.transition(CircuitState::Open);
        self.opened_at = Some(now);
    }

    fn transition(&mut self, next: CircuitState) {
        self.state = next;
        self.half_open_admitted = 0;
        self.half_open_successes = 0;
    }

    fn evict(&mut self, now: Instant) {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}
