//! Continuous token-bucket rate limiting.
//!
//! Three independent buckets per provider: requests, input tokens and
//! output tokens, all per minute. A call acquires all three at once using a
//! best-estimate of its token sizes; actual output is reconciled after the
//! call. Buckets refill continuously rather than in 60-second windows.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use scholarqa_core::CancelToken;

use crate::LlmError;

/// Per-minute ceilings plus the wait budget.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u64,
    pub input_tokens_per_minute: u64,
    pub output_tokens_per_minute: u64,
    /// A call that cannot acquire within this budget fails with
    /// `RateLimitedExhausted`.
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 300,
            input_tokens_per_minute: 200_000,
            output_tokens_per_minute: 50_000,
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u64) -> Self {
        Self {
            capacity: per_minute as f64,
            tokens: per_minute as f64,
            refill_per_sec: per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until `need` tokens are available, assuming no other consumers.
    fn time_until(&self, need: f64) -> Duration {
        if self.tokens >= need {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((need - self.tokens) / self.refill_per_sec)
    }

    /// Credit tokens back (or debit extra) after reconciliation.
    fn adjust(&mut self, delta: f64) {
        self.tokens = (self.tokens + delta).min(self.capacity);
    }
}

struct Buckets {
    requests: Bucket,
    input: Bucket,
    output: Bucket,
}

/// Process-wide limiter shared by every task. Constructed once and injected;
/// there is no global instance.
pub struct RateLimiter {
    inner: Mutex<Buckets>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(Buckets {
                requests: Bucket::new(config.requests_per_minute),
                input: Bucket::new(config.input_tokens_per_minute),
                output: Bucket::new(config.output_tokens_per_minute),
            }),
            max_wait: config.max_wait,
        }
    }

    /// Acquire one request slot plus the estimated token amounts from all
    /// three buckets. Returns how long the call waited.
    pub async fn acquire(
        &self,
        model: &str,
        input_tokens: u64,
        est_output_tokens: u64,
        cancel: &CancelToken,
    ) -> Result<Duration, LlmError> {
        let started = Instant::now();
        let deadline = started + self.max_wait;

        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let wait = {
                let mut buckets = self.inner.lock();
                let now = Instant::now();
                buckets.requests.refill(now);
                buckets.input.refill(now);
                buckets.output.refill(now);

                let need_in = input_tokens as f64;
                let need_out = est_output_tokens as f64;
                if buckets.requests.tokens >= 1.0
                    && buckets.input.tokens >= need_in
                    && buckets.output.tokens >= need_out
                {
                    buckets.requests.tokens -= 1.0;
                    buckets.input.tokens -= need_in;
                    buckets.output.tokens -= need_out;
                    return Ok(started.elapsed());
                }

                buckets
                    .requests
                    .time_until(1.0)
                    .max(buckets.input.time_until(need_in))
                    .max(buckets.output.time_until(need_out))
            };

            let wait = wait.max(Duration::from_millis(10));
            if Instant::now() + wait > deadline {
                return Err(LlmError::RateLimitedExhausted {
                    model: model.to_string(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            }
        }
    }

    /// Reconcile the output-token estimate against the provider-reported
    /// count once the call finishes.
    pub fn reconcile_output(&self, estimated: u64, actual: u64) {
        let delta = estimated as f64 - actual as f64;
        if delta != 0.0 {
            self.inner.lock().output.adjust(delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u64, wait_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            input_tokens_per_minute: 1_000_000,
            output_tokens_per_minute: 1_000_000,
            max_wait: Duration::from_millis(wait_ms),
        })
    }

    #[tokio::test]
    async fn test_acquire_succeeds_within_capacity() {
        let limiter = limiter(10, 100);
        let cancel = CancelToken::new();
        for _ in 0..5 {
            let waited = limiter.acquire("m", 100, 50, &cancel).await.unwrap();
            assert!(waited < Duration::from_millis(50));
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails() {
        // One request per minute refills far too slowly for a 50ms budget.
        let limiter = limiter(1, 50);
        let cancel = CancelToken::new();
        limiter.acquire("m", 1, 1, &cancel).await.unwrap();
        let err = limiter.acquire("m", 1, 1, &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimitedExhausted { .. }));
    }

    #[tokio::test]
    async fn test_burst_within_capacity_does_not_wait() {
        // 600 rpm refills 10 requests per second; with a burst capacity of
        // 600 the first calls never wait.
        let limiter = limiter(600, 1000);
        let cancel = CancelToken::new();
        let waited = limiter.acquire("m", 1, 1, &cancel).await.unwrap();
        assert!(waited < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let limiter = limiter(1, 10_000);
        let cancel = CancelToken::new();
        limiter.acquire("m", 1, 1, &cancel).await.unwrap();
        cancel.cancel();
        let err = limiter.acquire("m", 1, 1, &cancel).await.unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_reconcile_credits_unused_output() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 100,
            input_tokens_per_minute: 1_000_000,
            output_tokens_per_minute: 1000,
            max_wait: Duration::from_millis(50),
        });
        let cancel = CancelToken::new();
        limiter.acquire("m", 1, 1000, &cancel).await.unwrap();
        // Bucket is empty; crediting back 900 unused estimated tokens makes
        // the next acquisition possible again.
        limiter.reconcile_output(1000, 100);
        limiter.acquire("m", 1, 800, &cancel).await.unwrap();
    }
}
