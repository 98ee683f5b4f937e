//! Exponential backoff with full jitter for retryable `Nack`s (§4.1).

use rand::Rng;
use std::time::Duration;

/// `delay = uniform(0, base * 2^retries)`, capped at `max`.
///
/// `retries` is the attempt count *after* incrementing, matching the spec's worked example
/// (retries becomes 1 on the first retryable failure, drawing from `uniform(0, base*2^1)`).
pub fn full_jitter_delay(base: Duration, max: Duration, retries: u32) -> Duration {
    let exp = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    let upper = base.saturating_mul(exp as u32).min(max);
    if upper.is_zero() {
        return Duration::ZERO;
    }
    rand::rng().random_range(Duration::ZERO..=upper)
}
