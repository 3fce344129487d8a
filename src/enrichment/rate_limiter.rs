//! Token bucket for outbound lookups
//!
//! Capacity refills continuously at `rate` tokens per second up to `burst`.
//! Callers that find the bucket empty sleep for the exact deficit with the
//! lock released, then re-check.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Token bucket shared by all enrichment callers
pub struct RateLimiter {
    /// Tokens added per second
    rate: f64,

    /// Maximum accumulated tokens
    burst: f64,

    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Create a limiter that starts with a full bucket
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available, then take it
    pub async fn wait(&self) {
        loop {
            let deficit = match self.take_or_deficit() {
                None => return,
                Some(deficit) => deficit,
            };

            trace!("Rate limiter empty, sleeping {:?}", deficit);
            tokio::time::sleep(deficit).await;
        }
    }

    /// Take a token without waiting. Returns false when the bucket is empty.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        self.take_or_deficit().is_none()
    }

    /// Tokens currently available (after refill)
    #[cfg(test)]
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.rate, self.burst);
        bucket.tokens
    }

    /// Refill and take one token, or report how long until one is available
    fn take_or_deficit(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now(), self.rate, self.burst);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return None;
        }

        Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
    }
}
