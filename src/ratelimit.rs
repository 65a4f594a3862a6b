//! Global token-bucket rate limiter for the download scheduler (spec.md
//! §4.C `limit_rate`). Shared across every worker thread behind a `Mutex`
//! since the bound is a single process-wide ceiling, not a per-thread one.

use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

/// Bytes-per-second token bucket. `None` rate means unlimited.
pub struct RateLimiter {
    inner: Option<Mutex<Bucket>>,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: Option<u64>) -> Self {
        let inner = rate_per_sec.map(|rate| {
            let rate = rate as f64;
            Mutex::new(Bucket {
                capacity: rate,
                tokens: rate,
                rate_per_sec: rate,
                last_refill: Instant::now(),
            })
        });
        RateLimiter { inner }
    }

    pub fn unlimited() -> Self {
        RateLimiter { inner: None }
    }

    /// Block until `bytes` worth of budget is available, then consume it.
    pub fn acquire(&self, bytes: usize) {
        let Some(bucket) = &self.inner else { return };
        let mut bytes_remaining = bytes as f64;

        loop {
            let wait = {
                let mut bucket = bucket.lock().unwrap();
                bucket.refill();

                if bucket.tokens >= bytes_remaining {
                    bucket.tokens -= bytes_remaining;
                    bytes_remaining = 0.0;
                    None
                } else {
                    bytes_remaining -= bucket.tokens;
                    bucket.tokens = 0.0;
                    Some(Duration::from_secs_f64(
                        bytes_remaining / bucket.rate_per_sec,
                    ))
                }
            };

            match wait {
                None => break,
                Some(duration) => thread::sleep(duration.min(Duration::from_millis(250))),
            }
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(10_000_000);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn limited_bucket_allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(Some(1_000_000));
        let start = Instant::now();
        limiter.acquire(1_000_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
