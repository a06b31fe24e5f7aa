use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter keyed by caller (tenant id, peer address, ...).
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// - `max_tokens`: maximum burst size
    /// - `refill_rate`: tokens added per second
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one token for `key`. Returns `false` when limited.
    pub async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    /// Forget callers idle for at least `max_idle`.
    pub async fn cleanup(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
        before - buckets.len()
    }
}
