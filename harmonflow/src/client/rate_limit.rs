//! Token-bucket rate limiting.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled continuously at `rate` tokens per second.
///
/// Uses tokio's clock, so paused-time tests see deterministic refills.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    /// Creates a full bucket. A non-positive `rate` disables limiting.
    #[must_use]
    pub fn new(rate: f64, burst: usize) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns true if the bucket never blocks.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        !(self.rate.is_finite() && self.rate > 0.0)
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// one will be.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.rate, bucket.tokens).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.rate;
            Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        }
    }

    /// Waits until a token is available and takes it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available, for diagnostics.
    #[must_use]
    pub fn available(&self) -> f64 {
        self.bucket.lock().tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let bucket = TokenBucket::new(10.0, 2);

        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(bucket.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_paces_requests() {
        let bucket = TokenBucket::new(5.0, 1);
        let start = Instant::now();
        for _ in 0..6 {
            bucket.acquire().await;
        }
        // One from the initial burst, then five at 200ms each.
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert!(start.elapsed() < Duration::from_millis(1_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_rate_waits_without_overflow() {
        let bucket = TokenBucket::new(1.0e-300, 1);
        assert!(bucket.try_acquire().is_ok());
        assert_eq!(bucket.try_acquire().unwrap_err(), Duration::MAX);
    }

    #[test]
    fn test_unlimited() {
        let bucket = TokenBucket::new(0.0, 1);
        assert!(bucket.is_unlimited());
        for _ in 0..100 {
            assert!(bucket.try_acquire().is_ok());
        }
    }
}
