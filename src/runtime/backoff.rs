//! Delay computation: exponential backoff for step retries and uniform
//! jitter for poll intervals.

use std::time::Duration;

use super::RandomSource;

/// Fraction of the poll interval used for jitter, on each side.
pub const POLL_JITTER_FRACTION: f64 = 0.2;

/// Delay before the given 1-based attempt: `backoff_ms · 2^(attempt − 1)`,
/// capped at `max_backoff_ms`, with an optional ±`jitter_ms` uniform spread.
/// Never negative.
pub fn compute_backoff_delay(
    attempt: u32,
    backoff_ms: u64,
    max_backoff_ms: u64,
    jitter_ms: u64,
    random: &dyn RandomSource,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(max_backoff_ms);
    let delay_ms = if jitter_ms == 0 {
        base
    } else {
        let spread = (random.next_f64() * 2.0 - 1.0) * jitter_ms as f64;
        let jittered = base as f64 + spread;
        if jittered <= 0.0 { 0 } else { jittered as u64 }
    };
    Duration::from_millis(delay_ms)
}

/// Jittered polling interval: uniform in `[0.8·x, 1.2·x)`.
pub fn jittered_interval(interval_ms: u64, random: &dyn RandomSource) -> u64 {
    let fraction = random.next_f64() * (2.0 * POLL_JITTER_FRACTION) - POLL_JITTER_FRACTION;
    let value = interval_ms as f64 * (1.0 + fraction);
    if value <= 0.0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixedRandom;

    #[test]
    fn backoff_doubles_until_capped() {
        let random = FixedRandom::new(0.5);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| compute_backoff_delay(attempt, 100, 1_000, 0, &random).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn backoff_first_attempt_uses_initial_delay() {
        let random = FixedRandom::new(0.0);
        assert_eq!(
            compute_backoff_delay(1, 250, 5_000, 0, &random),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn backoff_jitter_is_bounded_and_non_negative() {
        let low = FixedRandom::new(0.0);
        let high = FixedRandom::new(0.999_999);
        // base 100, jitter 50 → [50, 150)
        let lowest = compute_backoff_delay(1, 100, 1_000, 50, &low).as_millis() as u64;
        let highest = compute_backoff_delay(1, 100, 1_000, 50, &high).as_millis() as u64;
        assert_eq!(lowest, 50);
        assert!(highest < 150);
        // jitter larger than the base still clamps at zero
        let clamped = compute_backoff_delay(1, 10, 1_000, 100, &low);
        assert_eq!(clamped, Duration::from_millis(0));
    }

    #[test]
    fn backoff_survives_large_attempt_numbers() {
        let random = FixedRandom::new(0.5);
        assert_eq!(
            compute_backoff_delay(u32::MAX, 100, 7_500, 0, &random),
            Duration::from_millis(7_500)
        );
    }

    #[test]
    fn jittered_interval_spans_twenty_percent() {
        assert_eq!(jittered_interval(100, &FixedRandom::new(0.0)), 80);
        assert_eq!(jittered_interval(100, &FixedRandom::new(0.5)), 100);
        assert_eq!(jittered_interval(100, &FixedRandom::new(0.999_999)), 119);
    }
}
