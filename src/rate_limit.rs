use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::context::{CallContext, Interrupt};
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitPolicy {
    capacity: f64,
    refill_per_second: f64,
    max_throttle_delay: Duration,
}

impl RateLimitPolicy {
    /// Bucket sized from a per-minute quota: capacity and refill rate are both
    /// `requests / 60`, with capacity never below one token.
    pub fn per_minute(requests: u32) -> Self {
        let per_second = f64::from(requests.max(1)) / 60.0;
        Self {
            capacity: per_second,
            refill_per_second: per_second,
            max_throttle_delay: Duration::from_secs(30),
        }
        .normalize()
    }

    pub fn capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self.normalize()
    }

    pub fn refill_per_second(mut self, refill_per_second: f64) -> Self {
        self.refill_per_second = refill_per_second;
        self.normalize()
    }

    pub const fn max_throttle_delay(mut self, max_throttle_delay: Duration) -> Self {
        self.max_throttle_delay = max_throttle_delay;
        self
    }

    pub fn configured_capacity(&self) -> f64 {
        self.capacity
    }

    pub fn configured_refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    fn normalize(self) -> Self {
        Self {
            capacity: if self.capacity.is_finite() {
                self.capacity.max(1.0)
            } else {
                1.0
            },
            refill_per_second: if self.refill_per_second.is_finite()
                && self.refill_per_second > 0.0
            {
                self.refill_per_second
            } else {
                1.0 / 60.0
            },
            max_throttle_delay: self.max_throttle_delay,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::per_minute(1000)
    }
}

#[derive(Debug)]
struct TokenBucket {
    policy: RateLimitPolicy,
    tokens: f64,
    last_refill_at: Instant,
    throttle_until: Option<Instant>,
}

impl TokenBucket {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        Self {
            policy,
            tokens: policy.capacity,
            last_refill_at: now,
            throttle_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed_secs = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        let replenished = elapsed_secs * self.policy.refill_per_second;
        self.tokens = (self.tokens + replenished).min(self.policy.capacity);
        if let Some(throttle_until) = self.throttle_until
            && now >= throttle_until
        {
            self.throttle_until = None;
        }
    }

    /// Takes a token if one is ready, otherwise reports how long to wait.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if let Some(throttle_until) = self.throttle_until
            && now < throttle_until
        {
            return Err(throttle_until.saturating_duration_since(now));
        }
        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            return Ok(());
        }

        let needed_tokens = (1.0 - self.tokens).max(0.0);
        let delay_secs = needed_tokens / self.policy.refill_per_second;
        Err(Duration::from_secs_f64(delay_secs).max(Duration::from_millis(1)))
    }

    fn apply_throttle(&mut self, now: Instant, delay: Duration) {
        let capped_delay = delay.min(self.policy.max_throttle_delay);
        if capped_delay.is_zero() {
            return;
        }
        let throttle_until = now + capped_delay;
        self.throttle_until = Some(match self.throttle_until {
            Some(existing) => existing.max(throttle_until),
            None => throttle_until,
        });
    }
}

/// Token bucket shared by every caller of one client.
///
/// Waiters queue on a fair async mutex so tokens are handed out in arrival
/// order. Only the head of the queue sleeps; refill is computed from elapsed
/// time whenever it looks at the bucket.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    queue: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub(crate) fn new(policy: RateLimitPolicy) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(policy.normalize(), Instant::now())),
            queue: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns whether the caller had to wait.
    pub(crate) async fn acquire(&self, context: &CallContext) -> Result<bool, Interrupt> {
        context
            .run(async {
                let _turn = self.queue.lock().await;
                let mut waited = false;
                loop {
                    let outcome = lock_unpoisoned(&self.bucket).try_acquire(Instant::now());
                    match outcome {
                        Ok(()) => return waited,
                        Err(wait) => {
                            debug!(wait_ms = wait.as_millis() as u64, "waiting for rate limit token");
                            waited = true;
                            sleep(wait).await;
                        }
                    }
                }
            })
            .await
    }

    pub(crate) fn observe_server_throttle(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        lock_unpoisoned(&self.bucket).apply_throttle(Instant::now(), delay);
    }

    #[cfg(test)]
    fn available_tokens(&self) -> f64 {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.refill(Instant::now());
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{RateLimitPolicy, RateLimiter, TokenBucket};
    use crate::context::{CallContext, Interrupt};

    #[test]
    fn per_minute_quota_derives_capacity_and_rate() {
        let policy = RateLimitPolicy::per_minute(1200);
        assert!((policy.configured_capacity() - 20.0).abs() < f64::EPSILON);
        assert!((policy.configured_refill_per_second() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tiny_quota_still_admits_one_request() {
        let policy = RateLimitPolicy::per_minute(30);
        assert!((policy.configured_capacity() - 1.0).abs() < f64::EPSILON);
        assert!((policy.configured_refill_per_second() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn bucket_never_admits_more_than_capacity_in_a_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(RateLimitPolicy::per_minute(300), start);
        let admitted = (0..20)
            .filter(|_| bucket.try_acquire(start).is_ok())
            .count();
        assert_eq!(admitted, 5);
        assert!(bucket.tokens >= 0.0);
    }

    #[test]
    fn bucket_refills_lazily_and_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(RateLimitPolicy::per_minute(120), start);
        assert!(bucket.try_acquire(start).is_ok());
        assert!(bucket.try_acquire(start).is_ok());
        let wait = bucket.try_acquire(start).expect_err("bucket should be empty");
        assert!(wait <= Duration::from_millis(500));

        bucket.refill(start + Duration::from_secs(3600));
        assert!(bucket.tokens <= 2.0);
        assert!((bucket.tokens - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn throughput_converges_to_refill_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(RateLimitPolicy::per_minute(600), start);
        let mut admitted = 0;
        for step in 0..=1000 {
            let now = start + Duration::from_millis(step * 10);
            while bucket.try_acquire(now).is_ok() {
                admitted += 1;
            }
        }
        // 10 initial tokens plus 10/s over 10 seconds.
        assert!((105..=111).contains(&admitted), "admitted={admitted}");
    }

    #[test]
    fn server_throttle_blocks_admission_until_it_expires() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(RateLimitPolicy::per_minute(600), start);
        bucket.apply_throttle(start, Duration::from_secs(2));
        let wait = bucket.try_acquire(start).expect_err("throttled");
        assert_eq!(wait, Duration::from_secs(2));
        assert!(bucket.try_acquire(start + Duration::from_secs(2)).is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_waiter_does_not_consume_a_token() {
        let limiter = RateLimiter::new(RateLimitPolicy::per_minute(60));
        let context = CallContext::new();
        assert_eq!(limiter.acquire(&context).await, Ok(false));

        let cancelled = CallContext::with_timeout(Duration::from_millis(30));
        let result = limiter.acquire(&cancelled).await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
        assert!(limiter.available_tokens() < 1.0);
        assert!(limiter.available_tokens() >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_are_served_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitPolicy::per_minute(60).refill_per_second(20.0),
        ));
        let order = Arc::new(Mutex::new(Vec::new()));
        assert_eq!(limiter.acquire(&CallContext::new()).await, Ok(false));

        let mut handles = Vec::new();
        for index in 0..4 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .acquire(&CallContext::new())
                    .await
                    .expect("token acquired");
                order.lock().expect("lock order").push(index);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.expect("waiter finished");
        }
        assert_eq!(*order.lock().expect("lock order"), vec![0, 1, 2, 3]);
    }
}
