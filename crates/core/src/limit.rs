//! Token-bucket rate limiting.
//!
//! One bucket caps the aggregate send rate across every connection's
//! writer; another caps the scanner's hashing throughput. Writers wait
//! asynchronously, the scanner blocks its thread, both against the same
//! bucket type.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A token bucket: `rate` tokens per second refill, `burst` capacity.
///
/// Consumers may overdraw the bucket with a single large request; the
/// debt is paid off by waiting before the next item proceeds.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `rate` bytes per second with the
    /// conventional 5x burst capacity.
    pub fn new(rate: u64) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            burst: rate * 5.0,
            state: Mutex::new(BucketState {
                tokens: rate * 5.0,
                refilled: Instant::now(),
            }),
        }
    }

    /// Deduct `n` tokens and return how long the caller must wait before
    /// proceeding. Zero when the bucket covers the request.
    pub fn reserve(&self, n: u64) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.refilled = now;
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    /// Wait out a reservation of `n` tokens without blocking the thread.
    pub async fn throttle(&self, n: u64) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait out a reservation of `n` tokens, blocking the thread. For
    /// use from the scanner's hashing loop only.
    pub fn throttle_blocking(&self, n: u64) {
        let wait = self.reserve(n);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn burst_passes_immediately() {
        let bucket = TokenBucket::new(1000);
        assert_eq!(Duration::ZERO, bucket.reserve(5000));
    }

    #[test]
    fn overdraw_waits_proportionally() {
        let bucket = TokenBucket::new(1000);
        bucket.reserve(5000);
        // The bucket is empty; another 500 tokens is half a second away.
        let wait = bucket.reserve(500);
        assert!(wait >= Duration::from_millis(400), "{wait:?}");
        assert!(wait <= Duration::from_millis(600), "{wait:?}");
    }

    #[test]
    fn refill_caps_at_burst() {
        let bucket = TokenBucket::new(1_000_000);
        std::thread::sleep(Duration::from_millis(20));
        // Even after idling, only the 5x burst is available.
        assert_eq!(Duration::ZERO, bucket.reserve(5_000_000));
        assert!(!bucket.reserve(1_000_000).is_zero());
    }
}
