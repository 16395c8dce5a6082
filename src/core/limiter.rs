// src/core/limiter.rs

//! Byte-rate limiting for object storage traffic.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// A token bucket refilled at `rate` bytes per second, holding at most one
/// second worth of tokens. A request larger than the bucket is admitted and
/// paid back by the requests that follow it.
pub struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `None` when `bytes_per_sec` is zero, meaning unlimited.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        let rate = bytes_per_sec as f64;
        Some(Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                last: Instant::now(),
            }),
        })
    }

    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    /// Takes `n` tokens, sleeping until the bucket is out of debt.
    pub async fn acquire(&self, n: usize) {
        let wait = {
            let mut bucket = self.bucket.lock();
            let now = Instant::now();
            let refill = now.duration_since(bucket.last).as_secs_f64() * self.rate;
            bucket.tokens = (bucket.tokens + refill).min(self.rate);
            bucket.last = now;
            bucket.tokens -= n as f64;
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / self.rate)
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
