//! Retry policy with exponential backoff and jitter (spec.md §4.C), in the
//! manual retry-loop style `aoscbootstrap`'s download helper uses, extended
//! with jittered exponential backoff instead of a fixed sleep.

use std::{thread, time::Duration};

use anyhow::Error;
use rand::Rng;

/// `retry_attempts`/`retry_delay` from the configuration, turned into a
/// concrete backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_secs: f64) -> Self {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_secs_f64(base_delay_secs),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before the attempt numbered `attempt` (1-based): `retry_delay *
    /// 2^(n-1)` per spec.md §4.C, with +/-20% jitter to avoid a thundering
    /// herd of workers retrying in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let unjittered = self.base_delay.saturating_mul(1 << exponent).min(self.max_delay);

        let jitter_fraction = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(unjittered.as_secs_f64() * jitter_fraction)
    }

    /// Run `op` up to `self.attempts` times. `op` receives the 1-based
    /// attempt number; `is_retryable` decides whether a given error should
    /// be retried at all (e.g. a 404 never should be).
    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, Error>,
        is_retryable: impl Fn(&Error) -> bool,
    ) -> Result<T, Error> {
        let mut last_err = None;
        for attempt in 1..=self.attempts.max(1) {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && is_retryable(&err) => {
                    let delay = self.delay_for(attempt);
                    eprintln!(
                        "attempt {attempt}/{} failed: {err}, retrying in {:.1}s",
                        self.attempts,
                        delay.as_secs_f64()
                    );
                    thread::sleep(delay);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn succeeds_without_retry_when_first_attempt_ok() {
        let policy = RetryPolicy::new(3, 0.001);
        let calls = AtomicU32::new(0);
        let result = policy.run(
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(42)
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_until_success_within_budget() {
        let policy = RetryPolicy::new(5, 0.001);
        let calls = AtomicU32::new(0);
        let result = policy.run(
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(anyhow::format_err!("transient"))
                } else {
                    Ok(())
                }
            },
            |_| true,
        );
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(5, 0.001);
        let calls = AtomicU32::new(0);
        let result: Result<(), Error> = policy.run(
            |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::format_err!("404 not found"))
            },
            |err| !err.to_string().contains("404"),
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausts_attempts_and_returns_last_error() {
        let policy = RetryPolicy::new(2, 0.001);
        let result: Result<(), Error> = policy.run(
            |attempt| Err(anyhow::format_err!("fail {attempt}")),
            |_| true,
        );
        assert_eq!(result.unwrap_err().to_string(), "fail 2");
    }
}
