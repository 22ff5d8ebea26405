//! Per-user token bucket. Pure state plus a caller-supplied clock, so the
//! refill math is testable without waiting.

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    /// Sustained rate, messages per minute.
    pub per_minute: u32,
    /// Burst capacity, messages.
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_minute: 100,
            burst: 20,
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(config: RateConfig, now: Instant) -> Self {
        let capacity = config.burst as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: config.per_minute as f64 / 60.0,
            last: now,
        }
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_reject() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(RateConfig::default(), t0);
        for _ in 0..20 {
            assert!(bucket.try_take(t0));
        }
        assert!(!bucket.try_take(t0));
    }

    #[test]
    fn refills_at_the_sustained_rate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(RateConfig::default(), t0);
        for _ in 0..20 {
            assert!(bucket.try_take(t0));
        }
        // 100/min = one token every 600 ms.
        assert!(!bucket.try_take(t0 + Duration::from_millis(100)));
        assert!(bucket.try_take(t0 + Duration::from_millis(700)));
        assert!(!bucket.try_take(t0 + Duration::from_millis(701)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(RateConfig::default(), t0);
        // A long idle period refills to the burst cap, not beyond.
        let later = t0 + Duration::from_secs(3600);
        for _ in 0..20 {
            assert!(bucket.try_take(later));
        }
        assert!(!bucket.try_take(later));
    }
}
