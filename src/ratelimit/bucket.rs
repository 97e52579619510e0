//! Per-key token bucket state and lazy refill arithmetic.

use std::time::{Duration, Instant};

use crate::config::{DenialPolicy, LimiterParams};

/// Cost of a single admitted request.
const REQUEST_COST: f64 = 1.0;

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket after this decision
    pub remaining: u64,
    /// How long until one token is available; zero when allowed
    pub retry_after: Duration,
}

/// Token bucket state for a single key.
///
/// Tokens are never topped up in the background. Each decision computes how
/// many tokens accrued since `last_accepted_at` and applies that delta on
/// demand, which for a single key is equivalent to continuous replenishment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Current token count, always within `[0, capacity]`
    pub tokens: f64,
    /// When the last admitted request for this key was seen
    pub last_accepted_at: Instant,
}

impl BucketState {
    /// State after the first request for a key, which is always admitted.
    pub fn bootstrap(params: &LimiterParams, now: Instant) -> Self {
        Self {
            tokens: params.capacity - REQUEST_COST,
            last_accepted_at: now,
        }
    }

    /// Token count this bucket would hold at `now`, without mutating it.
    ///
    /// Elapsed time is clamped to `[0, period]`: a clock that went backwards
    /// credits nothing, and a long idle gap credits at most a full period.
    pub fn refilled(&self, params: &LimiterParams, now: Instant) -> f64 {
        let elapsed = now
            .saturating_duration_since(self.last_accepted_at)
            .min(params.period);
        let credited = elapsed.as_secs_f64() * params.refill_per_sec;
        (self.tokens + credited).min(params.capacity)
    }

    /// Apply the refill up to `now` and move the clock forward.
    pub fn refill(&mut self, params: &LimiterParams, now: Instant) {
        self.tokens = self.refilled(params, now);
        if now > self.last_accepted_at {
            self.last_accepted_at = now;
        }
    }

    /// Decide a request arriving at `now`, spending a token if one is available.
    ///
    /// A request needs one whole token. A bucket holding a fraction of a token
    /// is denied rather than driven negative, so after a partial refill this
    /// admits one request fewer than a `tokens > 0` check would (16 instead of
    /// 17 for 16.67 accrued tokens).
    pub fn acquire(&mut self, params: &LimiterParams, now: Instant) -> Decision {
        let tokens = self.refilled(params, now);

        if tokens >= REQUEST_COST {
            self.tokens = tokens - REQUEST_COST;
            self.last_accepted_at = self.last_accepted_at.max(now);
            return Decision {
                allowed: true,
                remaining: self.tokens.floor() as u64,
                retry_after: Duration::ZERO,
            };
        }

        if params.denial_policy == DenialPolicy::CountAttempts {
            self.refill(params, now);
        }

        Decision {
            allowed: false,
            remaining: 0,
            // Accrual restarts at `last_accepted_at`, which may lie after `now`.
            retry_after: wait_for(REQUEST_COST - tokens, params)
                + self.last_accepted_at.saturating_duration_since(now),
        }
    }

    /// Whether the key has been quiet for at least `ttl` as of `now`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_accepted_at) >= ttl
    }
}

/// Time needed to accrue `missing` tokens at the configured rate.
fn wait_for(missing: f64, params: &LimiterParams) -> Duration {
    let secs = (missing / params.refill_per_sec).max(0.0);
    Duration::try_from_secs_f64(secs).unwrap_or(params.period)
}
