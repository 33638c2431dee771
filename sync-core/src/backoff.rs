//! Retry delay policies.
//!
//! Two independent policies: one for reconnecting the transport, one for
//! retrying failed gap-fill fetches inside the sync engine.

use std::time::Duration;

/// Attempts below this follow the growth curve; later ones are randomized.
pub const RECONNECT_CURVE_ATTEMPTS: u32 = 8;

const RECONNECT_CAP_SECS: f64 = 8.0;
const RECONNECT_JITTER_MIN_SECS: f64 = 7.0;
const RECONNECT_JITTER_SPAN_SECS: f64 = 4.0;

const FETCH_RETRY_BASE_MS: u64 = 500;
const FETCH_RETRY_CAP_MS: u64 = 30_000;

/// Delay before reconnect attempt `attempt`.
///
/// `min(8, 0.2 + attempt^1.5 * 0.4)` seconds below attempt 8, then a
/// random delay in `[7, 11)` seconds so clients recovering from the same
/// outage spread out.
pub fn reconnect_delay(attempt: u32) -> Duration {
    reconnect_delay_with(attempt, random_unit())
}

/// [`reconnect_delay`] with the random draw supplied (`unit` in `[0, 1)`).
pub fn reconnect_delay_with(attempt: u32, unit: f64) -> Duration {
    let secs = if attempt < RECONNECT_CURVE_ATTEMPTS {
        (0.2 + f64::from(attempt).powf(1.5) * 0.4).min(RECONNECT_CAP_SECS)
    } else {
        RECONNECT_JITTER_MIN_SECS + unit.clamp(0.0, 0.999_999) * RECONNECT_JITTER_SPAN_SECS
    };
    Duration::from_secs_f64(secs)
}

/// Delay before retrying a failed fetch for the `attempt`-th time.
///
/// Exponential from 500ms, capped at 30s, with equal jitter: half the
/// delay is fixed and half is random.
pub fn fetch_retry_delay(attempt: u32) -> Duration {
    fetch_retry_delay_with(attempt, random_unit())
}

/// [`fetch_retry_delay`] with the random draw supplied.
pub fn fetch_retry_delay_with(attempt: u32, unit: f64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base_ms = FETCH_RETRY_BASE_MS
        .saturating_mul(1u64 << exp)
        .min(FETCH_RETRY_CAP_MS);
    let half = base_ms / 2;
    let jitter = (half as f64 * unit.clamp(0.0, 1.0)) as u64;
    Duration::from_millis(half + jitter)
}

/// Uniform random value in `[0, 1)`.
pub(crate) fn random_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0.5;
    }
    // 53 random bits fill the f64 mantissa exactly.
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Random 64-bit nonce.
pub(crate) fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_curve_matches_formula() {
        let secs = |attempt| reconnect_delay_with(attempt, 0.0).as_secs_f64();
        assert!((secs(0) - 0.2).abs() < 1e-6);
        assert!((secs(1) - 0.6).abs() < 1e-6);
        assert!((secs(4) - 3.4).abs() < 1e-6);
        assert!((secs(7) - 7.608).abs() < 1e-3);
    }

    #[test]
    fn reconnect_curve_is_non_decreasing_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 0..RECONNECT_CURVE_ATTEMPTS {
            let delay = reconnect_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went down");
            assert!(delay <= Duration::from_secs(8));
            previous = delay;
        }
    }

    #[test]
    fn reconnect_after_curve_is_randomized_in_range() {
        for attempt in RECONNECT_CURVE_ATTEMPTS..RECONNECT_CURVE_ATTEMPTS + 200 {
            let secs = reconnect_delay(attempt).as_secs_f64();
            assert!((7.0..11.0).contains(&secs), "attempt {attempt}: {secs}");
        }
        assert!(reconnect_delay_with(9, 1.0).as_secs_f64() < 11.0);
        assert_eq!(reconnect_delay_with(9, 0.0), Duration::from_secs(7));
    }

    #[test]
    fn reconnect_jitter_creates_variance() {
        let delays: Vec<Duration> = (0..20).map(|_| reconnect_delay(20)).collect();
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first));
    }

    #[test]
    fn fetch_retry_grows_then_caps() {
        assert_eq!(fetch_retry_delay_with(1, 1.0), Duration::from_millis(500));
        assert_eq!(fetch_retry_delay_with(2, 1.0), Duration::from_millis(1000));
        assert_eq!(fetch_retry_delay_with(3, 0.0), Duration::from_millis(1000));
        assert_eq!(fetch_retry_delay_with(40, 1.0), Duration::from_secs(30));
    }

    #[test]
    fn fetch_retry_is_at_least_half_the_base() {
        for attempt in 1..12 {
            let delay = fetch_retry_delay(attempt);
            let floor = fetch_retry_delay_with(attempt, 0.0);
            assert!(delay >= floor);
            assert!(delay <= floor * 2);
        }
    }

    #[test]
    fn random_unit_in_range() {
        for _ in 0..1000 {
            let u = random_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
