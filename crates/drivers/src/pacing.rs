//! Token bucket pacing for probe-per-target drivers

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct RateLimiter {
    state: Mutex<Bucket>,
    capacity: f64,
    refill_rate: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(probes_per_second: u64) -> Self {
        let rate = probes_per_second.max(1) as f64;
        Self {
            state: Mutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
            capacity: rate,
            refill_rate: rate,
        }
    }

    /// Limiter for an optional `rateLimit` option; `None` or zero means unpaced.
    pub fn from_option(rate: Option<u64>) -> Option<Self> {
        rate.filter(|r| *r > 0).map(Self::new)
    }

    pub async fn acquire(&self) {
        loop {
            let wait_time = {
                let mut bucket = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                let tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
                bucket.last_refill = now;
                if tokens >= 1.0 {
                    bucket.tokens = tokens - 1.0;
                    return;
                }
                bucket.tokens = tokens;
                Duration::from_secs_f64((1.0 - tokens) / self.refill_rate)
            };
            tokio::time::sleep(wait_time).await;
        }
    }
}

/// Blocking-thread counterpart: gap between sends for a given rate.
pub fn send_interval(rate: Option<u64>) -> Option<Duration> {
    rate.filter(|r| *r > 0)
        .map(|r| Duration::from_secs_f64(1.0 / r as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_paced() {
        let limiter = RateLimiter::new(20);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn zero_rate_means_unpaced() {
        assert!(RateLimiter::from_option(Some(0)).is_none());
        assert!(RateLimiter::from_option(None).is_none());
        assert_eq!(send_interval(Some(4)), Some(Duration::from_millis(250)));
    }
}
