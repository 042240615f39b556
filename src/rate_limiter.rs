use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Async token bucket limiting outbound exchange requests.
///
/// Tokens refill at `rate` per second up to `burst`. Each call consumes one
/// token; a caller that finds the bucket empty sleeps exactly long enough
/// for one token to accumulate. Acquisition is serialized on an internal
/// mutex so no request goes out without a token.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        TokenBucket {
            rate,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire one token, sleeping until one is available.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens < 1.0 {
            let wait = (1.0 - state.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            state.tokens = 0.0;
        } else {
            state.tokens -= 1.0;
        }
    }
}

impl Default for TokenBucket {
    /// Exchange default: 10 requests/second sustained, burst of 10.
    fn default() -> Self {
        TokenBucket::new(10.0, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_consumed_without_waiting() {
        let bucket = TokenBucket::new(10.0, 10);
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        // All ten burst tokens are available immediately.
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_one_token() {
        let bucket = TokenBucket::new(10.0, 10);
        for _ in 0..10 {
            bucket.acquire().await;
        }
        let before = Instant::now();
        bucket.acquire().await;
        // One token accrues in 1/rate = 100ms.
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let bucket = TokenBucket::new(10.0, 10);
        for _ in 0..10 {
            bucket.acquire().await;
        }
        // Half a second refills 5 tokens.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(10.0, 10);
        tokio::time::sleep(Duration::from_secs(60)).await;
        let start = Instant::now();
        for _ in 0..10 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        // The 11th must wait: the bucket never exceeds its burst size.
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
