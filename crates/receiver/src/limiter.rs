use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket refilled at `rate` per second up to `burst`. A rate of zero disables limiting.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { rate, burst, state: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }

    /// Reserve one token. Returns how long to wait for it, or `None` when that exceeds `max_wait`;
    /// nothing is reserved in that case.
    fn reserve(&self, max_wait: Duration) -> Option<Duration> {
        if self.rate <= 0.0 {
            return Some(Duration::ZERO);
        }
        let mut b = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        b.tokens = (b.tokens + now.duration_since(b.last).as_secs_f64() * self.rate).min(self.burst);
        b.last = now;
        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            return Some(Duration::ZERO);
        }
        let wait = Duration::from_secs_f64((1.0 - b.tokens) / self.rate);
        if wait > max_wait {
            return None;
        }
        b.tokens -= 1.0;
        Some(wait)
    }

    /// Wait for a token for at most `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> bool {
        match self.reserve(max_wait) {
            Some(wait) if wait.is_zero() => true,
            Some(wait) => {
                tokio::time::sleep(wait).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_passes_then_rejects_when_wait_is_too_long() {
        let bucket = TokenBucket::new(0.01, 3);
        for _ in 0..3 {
            assert!(bucket.acquire(Duration::from_millis(10)).await);
        }
        assert!(!bucket.acquire(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn short_waits_are_absorbed() {
        let bucket = TokenBucket::new(100.0, 1);
        assert!(bucket.acquire(Duration::ZERO).await);
        assert!(bucket.acquire(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0.0, 1);
        for _ in 0..100 {
            assert!(bucket.acquire(Duration::ZERO).await);
        }
    }
}
