//! Token-bucket rate limiting: one global bucket plus lazily created
//! per-credential buckets.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitDecision {
    Allowed,
    Denied { reason: String },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_minute: f64, burst_multiplier: f64) -> Self {
        let capacity = (rate_per_minute * burst_multiplier).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: rate_per_minute / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    /// Requests per minute; 0 disables the limiter entirely.
    rate_per_minute: u32,
    burst_multiplier: f64,
    global: Mutex<Bucket>,
    per_credential: DashMap<String, Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: u32) -> Self {
        let burst_multiplier = 3.0;
        Self {
            rate_per_minute,
            burst_multiplier,
            global: Mutex::new(Bucket::new(rate_per_minute as f64, burst_multiplier)),
            per_credential: DashMap::new(),
        }
    }

    /// Check both the global bucket and the credential's bucket.
    pub fn check(&self, credential_id: Option<&str>) -> LimitDecision {
        if self.rate_per_minute == 0 {
            return LimitDecision::Allowed;
        }

        if !self.global.lock().unwrap().try_take() {
            return LimitDecision::Denied {
                reason: "global rate limit exceeded".into(),
            };
        }

        if let Some(id) = credential_id {
            let bucket = self.per_credential.entry(id.to_string()).or_insert_with(|| {
                Mutex::new(Bucket::new(
                    self.rate_per_minute as f64,
                    self.burst_multiplier,
                ))
            });
            if !bucket.lock().unwrap().try_take() {
                return LimitDecision::Denied {
                    reason: format!("credential {} rate limit exceeded", id),
                };
            }
        }

        LimitDecision::Allowed
    }

    /// Drop all per-credential buckets once the map grows past 200 entries.
    /// Buckets are rebuilt full on next use, which is acceptable drift.
    pub fn cleanup(&self) {
        if self.per_credential.len() > 200 {
            let dropped = self.per_credential.len();
            self.per_credential.clear();
            tracing::debug!(dropped, "pruned per-credential rate buckets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_disables() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check(None).is_allowed());
        }
    }

    #[test]
    fn burst_capacity_then_denied() {
        let limiter = RateLimiter::new(10); // capacity 30 with 3x burst
        let mut allowed = 0;
        for _ in 0..50 {
            if limiter.check(None).is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 30);
    }

    #[test]
    fn per_credential_bucket_is_independent() {
        let limiter = RateLimiter::new(10);
        // Drain credential "a"; "b" must still have burst capacity left
        // in its own bucket (the global bucket is sized identically, so
        // interleave to stay under it).
        for _ in 0..15 {
            limiter.check(Some("a"));
        }
        assert!(limiter.check(Some("b")).is_allowed());
    }

    #[test]
    fn cleanup_prunes_large_maps() {
        let limiter = RateLimiter::new(1000);
        for i in 0..250 {
            limiter.check(Some(&format!("cred-{}", i)));
        }
        limiter.cleanup();
        assert_eq!(limiter.per_credential.len(), 0);
    }
}
