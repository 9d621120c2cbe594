//! Per-connection token-bucket rate limiting.
//!
//! Buckets are created lazily on a connection's first request and dropped on
//! disconnect. Refill is lazy: there are no timers, and the token count is a
//! pure function of the call timestamps and costs, so replaying a call
//! sequence with the same clocks reproduces the same decisions.

use dashmap::DashMap;
use parleyconf::RateConfig;
use std::time::Instant;

use crate::router::ConnectionId;

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Denied, with the earliest time the call could succeed.
    Denied { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// One connection's token bucket.
#[derive(Debug, Clone)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-connection token buckets with a per-method cost table.
pub struct RateLimiter {
    config: RateConfig,
    buckets: DashMap<ConnectionId, RateBucket>,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// The token cost of a method (1 unless overridden).
    pub fn cost_of(&self, method: &str) -> f64 {
        self.config
            .method_costs
            .get(method)
            .copied()
            .unwrap_or(1.0)
    }

    /// Try to consume tokens for `method` on `conn`.
    pub fn consume(&self, conn: ConnectionId, method: &str) -> RateDecision {
        self.consume_at(conn, method, Instant::now())
    }

    /// Clock-explicit form of [`RateLimiter::consume`] for deterministic replay.
    pub fn consume_at(&self, conn: ConnectionId, method: &str, now: Instant) -> RateDecision {
        let cost = self.cost_of(method);
        let mut bucket = self.buckets.entry(conn).or_insert_with(|| RateBucket {
            tokens: self.config.max_tokens,
            last_refill: now,
        });

        // Lazy refill since the last touch, capped at the bucket size.
        // Tokens accrue in whole units; `last_refill` advances only by the
        // time those whole tokens took, so fractional progress is never lost.
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let accrued = (elapsed.as_secs_f64() * self.config.refill_per_second).floor();
        if accrued > 0.0 {
            bucket.tokens = (bucket.tokens + accrued).min(self.config.max_tokens);
            bucket.last_refill += std::time::Duration::from_secs_f64(
                accrued / self.config.refill_per_second,
            );
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            RateDecision::Allowed
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after_ms =
                (deficit / self.config.refill_per_second * 1000.0).ceil() as u64;
            RateDecision::Denied { retry_after_ms }
        }
    }

    /// Drop a connection's bucket on disconnect.
    pub fn remove(&self, conn: ConnectionId) {
        self.buckets.remove(&conn);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn limiter(max_tokens: f64, refill: f64, costs: &[(&str, f64)]) -> RateLimiter {
        RateLimiter::new(RateConfig {
            max_tokens,
            refill_per_second: refill,
            method_costs: costs
                .iter()
                .map(|(name, cost)| (name.to_string(), *cost))
                .collect::<HashMap<_, _>>(),
        })
    }

    #[test]
    fn rate_limit_with_recovery() {
        // max 5 tokens, 1/s refill, prompt.submit costs 5.
        let limiter = limiter(5.0, 1.0, &[("prompt.submit", 5.0)]);
        let conn = ConnectionId::new();
        let t0 = Instant::now();

        // t=0: allowed, bucket drains to 0.
        assert_eq!(
            limiter.consume_at(conn, "prompt.submit", t0),
            RateDecision::Allowed
        );

        // t=0.1s: no whole token has accrued yet, so the full cost must
        // refill => 5000ms.
        let decision = limiter.consume_at(conn, "prompt.submit", t0 + Duration::from_millis(100));
        assert_eq!(decision, RateDecision::Denied { retry_after_ms: 5000 });

        // t=5s: five whole tokens have accrued since t=0, allowed again.
        assert_eq!(
            limiter.consume_at(conn, "prompt.submit", t0 + Duration::from_secs(5)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn denial_without_prior_refill_is_full_cost() {
        let limiter = limiter(5.0, 1.0, &[("prompt.submit", 5.0)]);
        let conn = ConnectionId::new();
        let t0 = Instant::now();

        assert!(limiter.consume_at(conn, "prompt.submit", t0).is_allowed());
        // Denied at the same instant: tokens are exactly 0, deficit is 5.
        assert_eq!(
            limiter.consume_at(conn, "prompt.submit", t0),
            RateDecision::Denied { retry_after_ms: 5000 }
        );
    }

    #[test]
    fn default_cost_is_one() {
        let limiter = limiter(2.0, 1.0, &[]);
        let conn = ConnectionId::new();
        let t0 = Instant::now();

        assert!(limiter.consume_at(conn, "health.ping", t0).is_allowed());
        assert!(limiter.consume_at(conn, "health.ping", t0).is_allowed());
        assert!(!limiter.consume_at(conn, "health.ping", t0).is_allowed());
    }

    #[test]
    fn refill_caps_at_max() {
        let limiter = limiter(3.0, 10.0, &[]);
        let conn = ConnectionId::new();
        let t0 = Instant::now();

        // Drain completely.
        for _ in 0..3 {
            assert!(limiter.consume_at(conn, "m", t0).is_allowed());
        }
        assert!(!limiter.consume_at(conn, "m", t0).is_allowed());

        // A long idle period refills to max, not beyond.
        let later = t0 + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(limiter.consume_at(conn, "m", later).is_allowed());
        }
        assert!(!limiter.consume_at(conn, "m", later).is_allowed());
    }

    #[test]
    fn buckets_are_per_connection() {
        let limiter = limiter(1.0, 1.0, &[]);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let t0 = Instant::now();

        assert!(limiter.consume_at(a, "m", t0).is_allowed());
        assert!(!limiter.consume_at(a, "m", t0).is_allowed());
        // Connection b has its own full bucket.
        assert!(limiter.consume_at(b, "m", t0).is_allowed());
    }

    #[test]
    fn disconnect_drops_bucket() {
        let limiter = limiter(1.0, 1.0, &[]);
        let conn = ConnectionId::new();
        let t0 = Instant::now();

        limiter.consume_at(conn, "m", t0);
        assert_eq!(limiter.bucket_count(), 1);
        limiter.remove(conn);
        assert_eq!(limiter.bucket_count(), 0);

        // A reconnect starts fresh.
        assert!(limiter.consume_at(conn, "m", t0).is_allowed());
    }

    #[test]
    fn monotonic_replay_is_deterministic() {
        let t0 = Instant::now();
        let schedule: Vec<Duration> = (0..20).map(|i| Duration::from_millis(i * 137)).collect();

        let run = || {
            let limiter = limiter(4.0, 2.0, &[("m", 3.0)]);
            let conn = ConnectionId::new();
            schedule
                .iter()
                .map(|offset| limiter.consume_at(conn, "m", t0 + *offset))
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }
}
