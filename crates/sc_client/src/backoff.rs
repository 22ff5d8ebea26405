//! Reconnect pacing: exponential backoff, capped, with jitter so a fleet of
//! clients does not stampede a recovering relay.

use std::time::Duration;

use rand::Rng;

/// Reconnection attempts before giving up with `PermanentlyDisconnected`.
pub const MAX_RECONNECT: u32 = 10;

const CAP: Duration = Duration::from_secs(60);
const JITTER: f64 = 0.25;

/// delay = min(base * 2^attempt, 60s) * (1 +/- 0.25)
pub fn delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX));
    let capped = exp.min(CAP);
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
    capped.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps_within_jitter_envelope() {
        let base = Duration::from_secs(1);
        for attempt in 0..20 {
            let d = delay(base, attempt);
            let ideal = (base * 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
                .min(CAP)
                .as_secs_f64();
            assert!(d.as_secs_f64() >= ideal * 0.75 - f64::EPSILON);
            assert!(d.as_secs_f64() <= ideal * 1.25 + f64::EPSILON);
        }
    }

    #[test]
    fn never_exceeds_cap_plus_jitter() {
        let base = Duration::from_secs(5);
        for attempt in 0..32 {
            assert!(delay(base, attempt) <= Duration::from_secs(75));
        }
    }
}
