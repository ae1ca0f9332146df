use std::time::{Duration, Instant};

/// Classic token bucket: capacity of one minute's worth of tokens, refilled
/// continuously. Callers that find it empty learn how long to wait.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(per_minute: u32, now: Instant) -> Self {
        TokenBucket::with_window(per_minute, Duration::from_secs(60), now)
    }

    /// A bucket refilling `capacity` tokens per `window` (the per-hour and
    /// per-day API gates).
    pub fn with_window(capacity: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64(),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token, or reports how long until one becomes available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TokenBucket;
    use std::time::{Duration, Instant};

    #[test]
    fn test_drains_and_refills() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(60, start);

        for _ in 0..60 {
            bucket.try_acquire(start).unwrap();
        }
        let wait = bucket.try_acquire(start).unwrap_err();
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));

        // One second later a single token is back.
        let later = start + Duration::from_secs(1);
        bucket.try_acquire(later).unwrap();
        assert!(bucket.try_acquire(later).is_err());
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(30, start);

        let much_later = start + Duration::from_secs(3600);
        for _ in 0..30 {
            bucket.try_acquire(much_later).unwrap();
        }
        assert!(bucket.try_acquire(much_later).is_err());
    }
}
