//! Per-client token-bucket rate limiter.
//!
//! Each client owns a short-term bucket (capacity `burst`, refilled at
//! `requests_per_minute / 60` per second) and, when configured, an hourly
//! bucket (capacity `requests_per_hour`, refilled evenly over an hour).
//! Buckets are created lazily, full, on a client's first request. On every
//! check both buckets refill by `elapsed * rate` (capped at capacity); the
//! request is allowed only if each holds a whole token, and then one token
//! is spent from each. The limiter is independent of engine load and never
//! touches the budget or the queue.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use synthgrid_core::config::RateLimitConfig;

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allow,
    /// Denied; every tier will have a token after `retry_after`.
    Deny { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Read-only view of a client's remaining allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Whole tokens left in the short-term bucket.
    pub remaining: u32,
    /// Whole tokens left in the hourly bucket, if that tier is enabled.
    pub remaining_hourly: Option<u32>,
    /// Time until every bucket is full again.
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Tier {
    capacity: f64,
    refill_per_sec: f64,
}

impl Tier {
    /// Time to accumulate `missing` tokens.
    fn refill_time(&self, missing: f64) -> Duration {
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.refill_per_sec)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(tier: &Tier, now: Instant) -> Self {
        Self {
            tokens: tier.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, tier: &Tier) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tier.refill_per_sec).min(tier.capacity);
        self.last_refill = now;
    }

    fn wait_for_token(&self, tier: &Tier) -> Duration {
        tier.refill_time(1.0 - self.tokens)
    }

    fn whole_tokens(&self) -> u32 {
        self.tokens.floor() as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientBuckets {
    short: Bucket,
    hourly: Option<Bucket>,
}

pub struct RateLimiter {
    enabled: bool,
    short: Tier,
    hourly: Option<Tier>,
    buckets: Mutex<HashMap<String, ClientBuckets>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let hourly = config.hourly_refill_per_sec().map(|refill_per_sec| Tier {
            capacity: f64::from(config.requests_per_hour),
            refill_per_sec,
        });
        Self {
            enabled: config.enabled,
            short: Tier {
                capacity: f64::from(config.burst),
                refill_per_sec: config.refill_per_sec(),
            },
            hourly,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client_key: &str) -> Decision {
        self.check_at(client_key, Instant::now())
    }

    pub fn check_at(&self, client_key: &str, now: Instant) -> Decision {
        if !self.enabled {
            return Decision::Allow;
        }

        let mut buckets = self.lock();
        let client = buckets
            .entry(client_key.to_string())
            .or_insert_with(|| self.fresh(now));
        self.refill(client, now);

        let mut retry_after = client.short.wait_for_token(&self.short);
        if let (Some(bucket), Some(tier)) = (&client.hourly, &self.hourly) {
            retry_after = retry_after.max(bucket.wait_for_token(tier));
        }

        if retry_after.is_zero() {
            client.short.tokens -= 1.0;
            if let Some(bucket) = client.hourly.as_mut() {
                bucket.tokens -= 1.0;
            }
            Decision::Allow
        } else {
            debug!(
                client = %client_key,
                tokens = client.short.tokens,
                hourly_tokens = client.hourly.map(|b| b.tokens),
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            Decision::Deny { retry_after }
        }
    }

    /// Remaining allowance for a client, or `None` when limiting is off.
    /// Does not spend tokens.
    pub fn quota(&self, client_key: &str) -> Option<Quota> {
        self.quota_at(client_key, Instant::now())
    }

    pub fn quota_at(&self, client_key: &str, now: Instant) -> Option<Quota> {
        if !self.enabled {
            return None;
        }

        let mut client = self
            .lock()
            .get(client_key)
            .copied()
            .unwrap_or_else(|| self.fresh(now));
        self.refill(&mut client, now);

        let mut reset_after = self.short.refill_time(self.short.capacity - client.short.tokens);
        if let (Some(bucket), Some(tier)) = (&client.hourly, &self.hourly) {
            reset_after = reset_after.max(tier.refill_time(tier.capacity - bucket.tokens));
        }
        Some(Quota {
            remaining: client.short.whole_tokens(),
            remaining_hourly: client.hourly.map(|b| b.whole_tokens()),
            reset_after,
        })
    }

    /// Tokens currently held in a client's short-term bucket, without refilling.
    pub fn tokens(&self, client_key: &str) -> Option<f64> {
        self.lock().get(client_key).map(|client| client.short.tokens)
    }

    /// Number of clients seen so far.
    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    fn fresh(&self, now: Instant) -> ClientBuckets {
        ClientBuckets {
            short: Bucket::full(&self.short, now),
            hourly: self.hourly.as_ref().map(|tier| Bucket::full(tier, now)),
        }
    }

    fn refill(&self, client: &mut ClientBuckets, now: Instant) {
        client.short.refill(now, &self.short);
        if let (Some(bucket), Some(tier)) = (client.hourly.as_mut(), &self.hourly) {
            bucket.refill(now, tier);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClientBuckets>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, requests_per_minute: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            burst,
            requests_per_minute,
            requests_per_hour: 0,
        })
    }

    fn two_tier(burst: u32, requests_per_minute: u32, requests_per_hour: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            burst,
            requests_per_minute,
            requests_per_hour,
        })
    }

    #[test]
    fn burst_then_deny_then_refill() {
        // capacity 5, one token per second
        let limiter = limiter(5, 60);
        let start = Instant::now();

        for _ in 0..5 {
            assert_eq!(limiter.check_at("alice", start), Decision::Allow);
        }
        let denied = limiter.check_at("alice", start + Duration::from_millis(500));
        match denied {
            Decision::Deny { retry_after } => {
                assert!(retry_after <= Duration::from_millis(500));
                assert!(retry_after > Duration::from_millis(400));
            }
            Decision::Allow => panic!("sixth request within the second must be denied"),
        }

        let later = start + Duration::from_secs(1);
        assert_eq!(limiter.check_at("alice", later), Decision::Allow);
        assert!(!limiter.check_at("alice", later).is_allowed());
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert!(limiter.check_at("alice", now).is_allowed());
        assert!(!limiter.check_at("alice", now).is_allowed());
        assert!(limiter.check_at("bob", now).is_allowed());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let limiter = limiter(3, 60);
        let now = Instant::now();

        assert!(limiter.check_at("alice", now).is_allowed());
        let much_later = now + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(limiter.check_at("alice", much_later).is_allowed());
        }
        assert!(!limiter.check_at("alice", much_later).is_allowed());
    }

    #[test]
    fn deny_does_not_spend_tokens() {
        let limiter = limiter(1, 60);
        let now = Instant::now();

        assert!(limiter.check_at("alice", now).is_allowed());
        for _ in 0..10 {
            assert!(!limiter.check_at("alice", now).is_allowed());
        }
        assert_eq!(limiter.tokens("alice"), Some(0.0));
        assert!(limiter.check_at("alice", now + Duration::from_secs(1)).is_allowed());
    }

    #[test]
    fn hourly_tier_caps_sustained_traffic() {
        // 60 per minute would allow 120 requests over two minutes; the hour allows 90.
        let limiter = two_tier(60, 60, 90);
        let start = Instant::now();

        let mut allowed = 0;
        for second in 0..120 {
            if limiter
                .check_at("alice", start + Duration::from_secs(second))
                .is_allowed()
            {
                allowed += 1;
            }
        }
        // 90 from the full hourly bucket plus what it refilled (one per 40s).
        assert!((90..=93).contains(&allowed), "allowed {allowed}");

        let last = start + Duration::from_secs(119);
        let quota = limiter.quota_at("alice", last).unwrap();
        assert_eq!(quota.remaining_hourly, Some(0));
        assert!(quota.remaining > 0);
        match limiter.check_at("alice", last) {
            Decision::Deny { retry_after } => assert!(retry_after <= Duration::from_secs(40)),
            Decision::Allow => panic!("hourly bucket is empty"),
        }
        assert!(limiter.check_at("alice", last + Duration::from_secs(40)).is_allowed());
    }

    #[test]
    fn quota_reports_remaining_and_reset_without_spending() {
        let limiter = two_tier(5, 60, 100);
        let now = Instant::now();

        let fresh = limiter.quota_at("alice", now).unwrap();
        assert_eq!(
            fresh,
            Quota {
                remaining: 5,
                remaining_hourly: Some(100),
                reset_after: Duration::ZERO,
            }
        );
        assert_eq!(limiter.tracked_clients(), 0);

        for _ in 0..2 {
            assert!(limiter.check_at("alice", now).is_allowed());
        }
        let quota = limiter.quota_at("alice", now).unwrap();
        assert_eq!(quota.remaining, 3);
        assert_eq!(quota.remaining_hourly, Some(98));
        // Two hourly tokens at 100 per hour take 72 seconds to come back.
        assert!(quota.reset_after > Duration::from_secs(71));
        assert!(quota.reset_after < Duration::from_secs(73));

        assert_eq!(limiter.quota_at("alice", now), Some(quota));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            burst: 1,
            requests_per_minute: 1,
            requests_per_hour: 1,
        });
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.check_at("alice", now).is_allowed());
        }
        assert_eq!(limiter.tracked_clients(), 0);
        assert_eq!(limiter.quota("alice"), None);
    }
}
