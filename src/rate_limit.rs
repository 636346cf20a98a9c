use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::types::SubscriptionId;

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub last_refill_age_ms: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let cap = f64::from(capacity.max(1));
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    pub fn try_take(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let age = Instant::now().duration_since(self.last_refill).as_millis() as u64;
        RateLimiterStats {
            capacity: self.capacity,
            tokens: self.tokens,
            refill_per_sec: self.refill_per_sec,
            last_refill_age_ms: age,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Per-subscription token buckets.
///
/// Each bucket sits behind its own lock; the map lock is only held to look a
/// bucket up or insert a new one, so subscriptions never wait on each other.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: RwLock<HashMap<SubscriptionId, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token for the subscription, if available.
    pub async fn try_acquire(&self, subscription_id: SubscriptionId) -> bool {
        let bucket = self.bucket(subscription_id).await;
        let mut bucket = bucket.lock().await;
        bucket.try_take()
    }

    pub async fn stats(&self) -> HashMap<SubscriptionId, RateLimiterStats> {
        let buckets: Vec<_> = {
            let guard = self.buckets.read().await;
            guard.iter().map(|(id, b)| (*id, Arc::clone(b))).collect()
        };

        let mut stats = HashMap::with_capacity(buckets.len());
        for (id, bucket) in buckets {
            stats.insert(id, bucket.lock().await.snapshot());
        }
        stats
    }

    /// Drop the bucket of a subscription that will not be delivered to again.
    pub async fn forget(&self, subscription_id: SubscriptionId) {
        self.buckets.write().await.remove(&subscription_id);
    }

    async fn bucket(&self, subscription_id: SubscriptionId) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.read().await.get(&subscription_id) {
            return Arc::clone(bucket);
        }

        let mut guard = self.buckets.write().await;
        let bucket = guard.entry(subscription_id).or_insert_with(|| {
            Arc::new(Mutex::new(TokenBucket::new(
                self.config.burst,
                self.config.refill_per_sec,
            )))
        });
        Arc::clone(bucket)
    }
}
