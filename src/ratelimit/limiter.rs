//! Core rate limiter implementation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::bucket::{BucketState, Decision};
use crate::config::{LimiterConfig, LimiterParams};
use crate::error::Result;

/// A per-key token bucket limiter.
///
/// Every key gets an independent bucket holding up to `capacity` tokens that
/// refills at `capacity / period` tokens per second. Each admitted request
/// spends one token.
///
/// The key store is a sharded map: a decision holds the write guard of the
/// key's shard from refill to update, so decisions for one key are totally
/// ordered while keys on other shards proceed in parallel. The limiter is
/// `Send + Sync` and is meant to be shared behind an `Arc`.
pub struct Limiter<K = String>
where
    K: Eq + Hash,
{
    /// Bucket state indexed by caller key
    buckets: DashMap<K, BucketState>,
    /// Validated parameters shared by every bucket
    params: LimiterParams,
}

impl<K> Limiter<K>
where
    K: Eq + Hash,
{
    /// Create a limiter, rejecting configurations it cannot run on.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        let params = config.validate()?;

        info!(
            capacity = params.capacity,
            period_secs = params.period.as_secs_f64(),
            refill_per_sec = params.refill_per_sec,
            denial_policy = ?params.denial_policy,
            "Rate limiter initialized"
        );

        Ok(Self {
            buckets: DashMap::new(),
            params,
        })
    }

    /// The parameters this limiter runs on.
    pub fn params(&self) -> &LimiterParams {
        &self.params
    }

    /// Decide whether a request for `key` arriving at `now` may proceed.
    pub fn allow<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
    {
        self.check(key, now).allowed
    }

    /// Like [`Limiter::allow`], reading the system clock.
    pub fn allow_now<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
    {
        self.allow(key, Instant::now())
    }

    /// Decide a request and report the remaining quota alongside the verdict.
    ///
    /// The first request ever seen for a key is always admitted and leaves
    /// `capacity - 1` tokens behind. An owned key is only allocated then.
    pub fn check<Q>(&self, key: &Q, now: Instant) -> Decision
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
    {
        if let Some(mut state) = self.buckets.get_mut(key) {
            return self.decide(key, state.value_mut(), now);
        }

        match self.buckets.entry(key.to_owned()) {
            // Another caller inserted the key between the lookup and here.
            Entry::Occupied(mut entry) => self.decide(key, entry.get_mut(), now),
            Entry::Vacant(entry) => {
                let state = BucketState::bootstrap(&self.params, now);
                trace!(key = ?key, tokens = state.tokens, "Creating bucket for new key");
                entry.insert(state);

                Decision {
                    allowed: true,
                    remaining: state.tokens.floor() as u64,
                    retry_after: Duration::ZERO,
                }
            }
        }
    }

    fn decide<Q>(&self, key: &Q, state: &mut BucketState, now: Instant) -> Decision
    where
        Q: Debug + ?Sized,
    {
        let decision = state.acquire(&self.params, now);

        if !decision.allowed {
            debug!(
                key = ?key,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Tokens `key` would have at `now`, without spending or storing anything.
    ///
    /// Unknown keys report a full bucket.
    pub fn available<Q>(&self, key: &Q, now: Instant) -> f64
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buckets
            .get(key)
            .map(|state| state.refilled(&self.params, now))
            .unwrap_or(self.params.capacity)
    }

    /// A copy of the stored state for `key`, if any.
    pub fn snapshot<Q>(&self, key: &Q) -> Option<BucketState>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buckets.get(key).map(|state| *state)
    }

    /// Drop the state for `key`. Returns whether it was tracked.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buckets.remove(key).is_some()
    }

    /// Drop every key that has been idle for at least the configured idle TTL.
    ///
    /// The TTL is never shorter than the period, and a bucket idle for a full
    /// period is back at capacity, so an evicted key's next request is decided
    /// exactly as if its state had been kept.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.params.idle_ttl;
        let mut removed = 0;

        self.buckets.retain(|_, state| {
            let keep = !state.is_idle(now, ttl);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Evicted idle keys");
        }

        removed
    }

    /// Clear all keys.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DenialPolicy;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::thread;

    fn limiter(capacity: f64, period_secs: u64) -> Limiter {
        Limiter::new(LimiterConfig::new(capacity, Duration::from_secs(period_secs))).unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = limiter(100.0, 60);
        assert_eq!(limiter.len(), 0);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Limiter::<String>::new(LimiterConfig::new(0.0, Duration::from_secs(60)));
        assert!(result.is_err());

        let result = Limiter::<String>::new(LimiterConfig::new(10.0, Duration::ZERO));
        assert!(result.is_err());
    }

    #[test]
    fn test_first_request_bootstraps_bucket() {
        let limiter = limiter(100.0, 60);
        let now = Instant::now();

        let decision = limiter.check("user-1", now);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 99);

        let state = limiter.snapshot("user-1").unwrap();
        assert_eq!(state.tokens, 99.0);
        assert_eq!(state.last_accepted_at, now);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_burst_then_refill_scenario() {
        let limiter = limiter(100.0, 60);
        let t0 = Instant::now();

        for i in 1..=100 {
            assert!(limiter.allow("10", t0), "request {} should be allowed", i);
        }
        assert!(!limiter.allow("10", t0), "request 101 should be denied");

        // Ten seconds later about 16.67 tokens have accrued.
        let t1 = t0 + Duration::from_secs(10);
        let tokens = limiter.available("10", t1);
        assert!((tokens - 1000.0 / 60.0).abs() < 1e-9, "got {}", tokens);

        let allowed = (0..20).filter(|_| limiter.allow("10", t1)).count();
        assert_eq!(allowed, 16);
        assert!(!limiter.allow("10", t1));
    }

    #[test]
    fn test_denial_leaves_state_untouched() {
        let limiter = limiter(2.0, 60);
        let t0 = Instant::now();

        assert!(limiter.allow("k", t0));
        assert!(limiter.allow("k", t0));
        let before = limiter.snapshot("k").unwrap();

        for ms in [1, 50, 300] {
            assert!(!limiter.allow("k", t0 + Duration::from_millis(ms)));
            assert_eq!(limiter.snapshot("k").unwrap(), before);
        }
    }

    #[test]
    fn test_denials_do_not_delay_refill() {
        // One token every 30 seconds.
        let limiter = limiter(2.0, 60);
        let t0 = Instant::now();

        assert!(limiter.allow("k", t0));
        assert!(limiter.allow("k", t0));
        assert!(!limiter.allow("k", t0 + Duration::from_secs(20)));
        assert!(!limiter.allow("k", t0 + Duration::from_secs(29)));

        // Accrual is measured from the last admitted request at t0.
        assert!(limiter.allow("k", t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_count_attempts_policy_advances_clock() {
        let config = LimiterConfig::new(2.0, Duration::from_secs(60))
            .with_denial_policy(DenialPolicy::CountAttempts);
        let limiter: Limiter = Limiter::new(config).unwrap();
        let t0 = Instant::now();

        assert!(limiter.allow("k", t0));
        assert!(limiter.allow("k", t0));

        let t1 = t0 + Duration::from_secs(20);
        assert!(!limiter.allow("k", t1));
        let state = limiter.snapshot("k").unwrap();
        assert_eq!(state.last_accepted_at, t1);
        assert!(state.tokens > 0.0 && state.tokens < 1.0);

        assert!(limiter.allow("k", t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_idle_key_refills_to_capacity() {
        let limiter = limiter(100.0, 60);
        let t0 = Instant::now();

        for _ in 0..40 {
            limiter.allow("k", t0);
        }
        assert_eq!(limiter.available("k", t0 + Duration::from_secs(60)), 100.0);
        assert_eq!(limiter.available("k", t0 + Duration::from_secs(600)), 100.0);

        assert!(limiter.allow("k", t0 + Duration::from_secs(61)));
        assert_eq!(limiter.snapshot("k").unwrap().tokens, 99.0);
    }

    #[test]
    fn test_backwards_time_does_not_refill() {
        let limiter = limiter(1.0, 1);
        let t0 = Instant::now() + Duration::from_secs(60);

        assert!(limiter.allow("k", t0));
        assert!(!limiter.allow("k", t0 - Duration::from_secs(30)));

        let state = limiter.snapshot("k").unwrap();
        assert_eq!(state.tokens, 0.0);
        assert_eq!(state.last_accepted_at, t0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(3.0, 60);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow("a", t0));
        }
        assert!(!limiter.allow("a", t0));

        assert!(limiter.allow("b", t0 + Duration::from_secs(1)));
        let b = limiter.snapshot("b").unwrap();
        assert_eq!(b.tokens, 2.0);

        let a = limiter.snapshot("a").unwrap();
        assert_eq!(a.tokens, 0.0);
        assert_eq!(a.last_accepted_at, t0);
    }

    #[test]
    fn test_integer_keys() {
        let limiter: Limiter<u64> =
            Limiter::new(LimiterConfig::new(1.0, Duration::from_secs(1))).unwrap();
        let t0 = Instant::now();

        assert!(limiter.allow(&7u64, t0));
        assert!(!limiter.allow(&7u64, t0));
        assert!(limiter.allow(&8u64, t0));
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let limiter = limiter(5.0, 2);
        let mut rng = StdRng::seed_from_u64(0x7011);
        let keys = ["a", "b", "c"];
        let mut now = Instant::now() + Duration::from_secs(3600);

        for _ in 0..5_000 {
            let step = rng.gen_range(0..400u64);
            if rng.gen_bool(0.05) {
                now -= Duration::from_millis(step);
            } else {
                now += Duration::from_millis(step);
            }

            let key = keys[rng.gen_range(0..keys.len())];
            limiter.allow(key, now);

            let tokens = limiter.snapshot(key).unwrap().tokens;
            assert!((0.0..=5.0).contains(&tokens), "tokens out of range: {}", tokens);
        }
    }

    #[test]
    fn test_evict_idle_keeps_recent_keys() {
        let limiter = limiter(10.0, 60);
        let t0 = Instant::now();

        limiter.allow("old", t0);
        limiter.allow("recent", t0 + Duration::from_secs(30));

        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(59)), 0);
        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(60)), 1);

        assert!(limiter.snapshot("old").is_none());
        assert!(limiter.snapshot("recent").is_some());
    }

    #[test]
    fn test_eviction_is_unobservable() {
        let kept = limiter(4.0, 10);
        let evicted = limiter(4.0, 10);
        let t0 = Instant::now();

        for limiter in [&kept, &evicted] {
            for _ in 0..3 {
                limiter.allow("k", t0);
            }
        }

        let t1 = t0 + Duration::from_secs(12);
        assert_eq!(evicted.evict_idle(t1), 1);
        assert_eq!(kept.len(), 1);

        for i in 0..6 {
            let now = t1 + Duration::from_millis(i * 100);
            assert_eq!(kept.check("k", now), evicted.check("k", now));
        }
        assert_eq!(kept.snapshot("k"), evicted.snapshot("k"));
    }

    #[test]
    fn test_custom_idle_ttl() {
        let config =
            LimiterConfig::new(10.0, Duration::from_secs(60)).with_idle_ttl(Duration::from_secs(300));
        let limiter: Limiter = Limiter::new(config).unwrap();
        let t0 = Instant::now();

        limiter.allow("k", t0);
        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(120)), 0);
        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(300)), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let limiter = limiter(10.0, 60);
        let t0 = Instant::now();

        limiter.allow("a", t0);
        limiter.allow("b", t0);
        assert!(limiter.remove("a"));
        assert!(!limiter.remove("a"));
        assert_eq!(limiter.len(), 1);

        limiter.clear();
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_concurrent_callers_share_one_bucket() {
        let limiter = Arc::new(limiter(50.0, 3600));
        let t0 = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || (0..100).filter(|_| limiter.allow("shared", t0)).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
        assert_eq!(limiter.snapshot("shared").unwrap().tokens, 0.0);
    }
}
