//! Jittered exponential backoff schedule for the wait loop (component J).
//!
//! `50ms · 2^min(attempt, 6)`, capped at 2s, then scaled by a uniform
//! random factor in `[0.75, 1.25]` — desynchronizes competing waiters so
//! they don't retry in lockstep.

use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_millis(50);
const CAP: Duration = Duration::from_secs(2);
const MAX_EXPONENT: u32 = 6;

/// The un-jittered backoff base for `attempt` (0-indexed), before the
/// `[0.75, 1.25]` jitter factor is applied. Exposed mainly for testing the
/// jitter bounds.
pub fn backoff_base(attempt: u32) -> Duration {
    let exponent = attempt.min(MAX_EXPONENT);
    let millis = BASE.as_millis() as u64 * (1u64 << exponent);
    Duration::from_millis(millis).min(CAP)
}

/// The jittered backoff interval for `attempt`: `[base * 0.75, base * 1.25]`.
pub fn backoff_interval(attempt: u32) -> (Duration, Duration) {
    let base = backoff_base(attempt);
    let lo = base.mul_f64(0.75);
    let hi = base.mul_f64(1.25);
    (lo, hi)
}

/// A single jittered delay sample for `attempt`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = backoff_base(attempt);
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}
